use crate::state::RunState;

#[derive(Debug)]
pub struct TlsCounter {
    // mutex is used primarily from one thread, so it's not a bottleneck
    count: thread_local::ThreadLocal<std::sync::Mutex<u64>>,
}

fn read(value: &std::sync::Mutex<u64>) -> u64 {
    *value.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl TlsCounter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            count: thread_local::ThreadLocal::new(),
        }
    }

    pub fn add(&self, value: u64) {
        let mutex = self.count.get_or(|| std::sync::Mutex::new(0));
        let mut guard = mutex
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard += value;
    }

    pub fn inc(&self) {
        self.add(1);
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.count.iter().fold(0, |x, y| x + read(y))
    }
}

impl Default for TlsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Position of a stage within its item list, used for the `[done/total]` prefix of item lines.
#[derive(Debug, Default)]
pub struct StageProgress {
    total: std::sync::atomic::AtomicU64,
    done: std::sync::atomic::AtomicU64,
}

impl StageProgress {
    pub fn start(&self, total: u64) {
        self.total
            .store(total, std::sync::atomic::Ordering::Release);
        self.done.store(0, std::sync::atomic::Ordering::Release);
    }

    /// Marks one more item as done and returns `(done, total)` including it.
    pub fn tick(&self) -> (u64, u64) {
        let done = self.done.fetch_add(1, std::sync::atomic::Ordering::AcqRel) + 1;
        (done, self.total.load(std::sync::atomic::Ordering::Acquire))
    }

    #[must_use]
    pub fn get(&self) -> (u64, u64) {
        (
            self.done.load(std::sync::atomic::Ordering::Acquire),
            self.total.load(std::sync::atomic::Ordering::Acquire),
        )
    }
}

pub struct ProgressPrinter<'a> {
    state: &'a RunState,
    last_items: u64,
    last_bytes: u64,
    last_update: std::time::Instant,
}

impl<'a> ProgressPrinter<'a> {
    pub fn new(state: &'a RunState) -> Self {
        Self {
            state,
            last_items: state.items_done(),
            last_bytes: state.bytes_uploaded.get(),
            last_update: std::time::Instant::now(),
        }
    }

    /// One-line status for the progress bar.
    pub fn line(&self) -> String {
        let (done, total) = self.state.current_progress();
        format!(
            "{}: {}/{} | uploaded {} ({}) | deleted {} | errors {}",
            self.state.stage(),
            done,
            total,
            self.state.files_uploaded.get(),
            bytesize::ByteSize(self.state.bytes_uploaded.get()),
            self.state.objects_deleted.get(),
            self.state.error_count(),
        )
    }

    pub fn print(&mut self) -> String {
        let time_now = std::time::Instant::now();
        let total_duration_secs = self.state.elapsed().as_secs_f64();
        let curr_duration_secs = (time_now - self.last_update).as_secs_f64();
        let items = self.state.items_done();
        let average_items_rate = items as f64 / total_duration_secs;
        let current_items_rate = items.saturating_sub(self.last_items) as f64 / curr_duration_secs;
        let bytes = self.state.bytes_uploaded.get();
        let average_bytes_rate = bytes as f64 / total_duration_secs;
        let current_bytes_rate = bytes.saturating_sub(self.last_bytes) as f64 / curr_duration_secs;
        self.last_items = items;
        self.last_bytes = bytes;
        self.last_update = time_now;
        let (done, total) = self.state.current_progress();
        format!(
            "---------------------\n\
            STAGE: {} ({}/{})\n\
            in flight: {:>10}\n\
            average:   {:>10.2} items/s\n\
            current:   {:>10.2} items/s\n\
            -----------------------\n\
            UPLOADED:\n\
            average: {:>10}/s\n\
            current: {:>10}/s\n\
            total:   {:>10}\n\
            files:   {:>10}\n\
            -----------------------\n\
            unchanged: {:>10}\n\
            deleted:   {:>10}\n\
            errors:    {:>10}",
            self.state.stage(),
            done,
            total,
            self.state.in_flight.len(),
            average_items_rate,
            current_items_rate,
            bytesize::ByteSize(average_bytes_rate as u64),
            bytesize::ByteSize(current_bytes_rate as u64),
            bytesize::ByteSize(bytes),
            self.state.files_uploaded.get(),
            self.state.files_unchanged.get(),
            self.state.objects_deleted.get(),
            self.state.error_count(),
        )
    }
}
