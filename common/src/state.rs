//! Run-scoped state shared by every stage and worker of one sync run
//!
//! Workers of a stage update the counters and append errors concurrently; the orchestrator reads
//! them at stage boundaries. [`RunState::snapshot`] may be called at any time by an outside
//! observer.

use std::sync::Arc;

use crate::progress::{StageProgress, TlsCounter};
use crate::queue::{InFlight, InFlightItem};
use crate::summary::{StageTimes, Summary};

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum Stage {
    #[default]
    Enumerate,
    Compare,
    Upload,
    Reconcile,
    Done,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Stage::Enumerate => "enumerate",
            Stage::Compare => "compare",
            Stage::Upload => "upload",
            Stage::Reconcile => "reconcile",
            Stage::Done => "done",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug)]
pub struct RunState {
    pub files_found: TlsCounter,
    pub files_rejected: TlsCounter,
    pub files_unchanged: TlsCounter,
    pub upload_candidates: TlsCounter,
    pub compare_failed: TlsCounter,
    pub files_uploaded: TlsCounter,
    pub bytes_uploaded: TlsCounter,
    pub upload_failed: TlsCounter,
    pub remote_objects_listed: TlsCounter,
    pub delete_candidates: TlsCounter,
    pub objects_deleted: TlsCounter,
    pub delete_failed: TlsCounter,
    pub compare: StageProgress,
    pub upload: StageProgress,
    pub reconcile: StageProgress,
    pub in_flight: Arc<InFlight>,
    errors: std::sync::Mutex<Vec<String>>,
    stage: std::sync::Mutex<(Stage, std::time::Instant)>,
    times: std::sync::Mutex<StageTimes>,
    start_time: std::time::Instant,
}

fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl RunState {
    #[must_use]
    pub fn new() -> Self {
        let now = std::time::Instant::now();
        Self {
            files_found: TlsCounter::new(),
            files_rejected: TlsCounter::new(),
            files_unchanged: TlsCounter::new(),
            upload_candidates: TlsCounter::new(),
            compare_failed: TlsCounter::new(),
            files_uploaded: TlsCounter::new(),
            bytes_uploaded: TlsCounter::new(),
            upload_failed: TlsCounter::new(),
            remote_objects_listed: TlsCounter::new(),
            delete_candidates: TlsCounter::new(),
            objects_deleted: TlsCounter::new(),
            delete_failed: TlsCounter::new(),
            compare: StageProgress::default(),
            upload: StageProgress::default(),
            reconcile: StageProgress::default(),
            in_flight: Arc::new(InFlight::new()),
            errors: std::sync::Mutex::new(vec![]),
            stage: std::sync::Mutex::new((Stage::Enumerate, now)),
            times: std::sync::Mutex::new(StageTimes::default()),
            start_time: now,
        }
    }

    /// Switches to `stage`, charging the time since the last switch to the previous stage.
    pub fn enter_stage(&self, stage: Stage) {
        let mut current = lock(&self.stage);
        let elapsed = current.1.elapsed();
        {
            let mut times = lock(&self.times);
            match current.0 {
                Stage::Enumerate => times.enumerate += elapsed,
                Stage::Compare => times.compare += elapsed,
                Stage::Upload => times.upload += elapsed,
                Stage::Reconcile => times.reconcile += elapsed,
                Stage::Done => {}
            }
        }
        tracing::debug!("stage {} -> {} after {:?}", current.0, stage, elapsed);
        *current = (stage, std::time::Instant::now());
    }

    #[must_use]
    pub fn stage(&self) -> Stage {
        lock(&self.stage).0
    }

    /// Appends to the run's error list; each entry is reported verbatim at the end.
    pub fn record_error(&self, error: String) {
        tracing::error!("{}", &error);
        lock(&self.errors).push(error);
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        lock(&self.errors).len()
    }

    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        lock(&self.errors).clone()
    }

    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    #[must_use]
    pub fn stage_times(&self) -> StageTimes {
        *lock(&self.times)
    }

    /// Items completed across all stages.
    #[must_use]
    pub fn items_done(&self) -> u64 {
        self.compare.get().0 + self.upload.get().0 + self.reconcile.get().0
    }

    /// `(done, total)` of the stage currently running.
    #[must_use]
    pub fn current_progress(&self) -> (u64, u64) {
        match self.stage() {
            Stage::Compare => self.compare.get(),
            Stage::Upload => self.upload.get(),
            Stage::Reconcile => self.reconcile.get(),
            Stage::Enumerate | Stage::Done => (0, 0),
        }
    }

    #[must_use]
    pub fn summary(&self) -> Summary {
        Summary {
            files_found: self.files_found.get(),
            files_rejected: self.files_rejected.get(),
            files_unchanged: self.files_unchanged.get(),
            upload_candidates: self.upload_candidates.get(),
            compare_failed: self.compare_failed.get(),
            files_uploaded: self.files_uploaded.get(),
            bytes_uploaded: self.bytes_uploaded.get(),
            upload_failed: self.upload_failed.get(),
            remote_objects_listed: self.remote_objects_listed.get(),
            delete_candidates: self.delete_candidates.get(),
            objects_deleted: self.objects_deleted.get(),
            delete_failed: self.delete_failed.get(),
            times: self.stage_times(),
            total_time: self.elapsed(),
        }
    }

    /// Read-only view of the run; does not pause or alter any queue.
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            stage: self.stage(),
            progress: self.current_progress(),
            elapsed: self.elapsed(),
            errors: self.error_count(),
            summary: self.summary(),
            in_flight: self.in_flight.snapshot(),
        }
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub stage: Stage,
    pub progress: (u64, u64),
    pub elapsed: std::time::Duration,
    pub errors: usize,
    pub summary: Summary,
    pub in_flight: Vec<InFlightItem>,
}

impl std::fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(
            f,
            "stage: {} ({}/{}), running for {}, {} error(s)",
            self.stage,
            self.progress.0,
            self.progress.1,
            crate::summary::format_duration(self.elapsed),
            self.errors
        )?;
        writeln!(f, "in flight: {}", self.in_flight.len())?;
        for item in &self.in_flight {
            writeln!(
                f,
                "  [{}] {} ({})",
                item.queue,
                item.item,
                crate::summary::format_duration(item.started.elapsed())
            )?;
        }
        Ok(())
    }
}
