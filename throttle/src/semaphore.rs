use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A tokio semaphore that is a no-op until it is given a non-zero capacity.
///
/// Used both as a plain concurrency limit (permits returned on drop) and as a token bucket
/// (permits forgotten on use and topped up by [`TokenGate::refill_forever`]).
pub struct TokenGate {
    enabled: AtomicBool,
    capacity: AtomicUsize,
    sem: tokio::sync::Semaphore,
}

impl TokenGate {
    pub const fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            capacity: AtomicUsize::new(0),
            sem: tokio::sync::Semaphore::const_new(0),
        }
    }

    /// Reconfigures the gate; a capacity of 0 disables it.
    pub fn configure(&self, capacity: usize) {
        let capacity = capacity.min(tokio::sync::Semaphore::MAX_PERMITS);
        self.enabled.store(capacity > 0, Ordering::Release);
        self.capacity.store(capacity, Ordering::Release);
        self.sem.forget_permits(self.sem.available_permits());
        if capacity > 0 {
            self.sem.add_permits(capacity);
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Waits for a permit that is returned to the gate when dropped.
    pub async fn hold(&self) -> Option<tokio::sync::SemaphorePermit<'_>> {
        if !self.is_enabled() {
            return None;
        }
        // the semaphore is never closed, an error here can only mean it was
        self.sem.acquire().await.ok()
    }

    /// Waits for a single token and consumes it.
    pub async fn take(&self) {
        if !self.is_enabled() {
            return;
        }
        if let Ok(permit) = self.sem.acquire().await {
            permit.forget();
        }
    }

    /// Tops the gate back up to `capacity` tokens every `interval`, never returns while enabled.
    pub async fn refill_forever(&self, interval: std::time::Duration) {
        if !self.is_enabled() {
            return;
        }
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let capacity = self.capacity();
            let available = self.sem.available_permits();
            if available < capacity {
                self.sem.add_permits(capacity - available);
            }
        }
    }
}

impl Default for TokenGate {
    fn default() -> Self {
        Self::new()
    }
}
