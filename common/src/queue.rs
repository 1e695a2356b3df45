//! Bounded worker pool
//!
//! [`BoundedQueue::run_all`] runs a worker over a finite list of items with at most `limit`
//! workers outstanding at any time and returns once every item has completed, which is the
//! barrier between pipeline stages. Completion order is unspecified.
//!
//! Every running item is registered in a shared [`InFlight`] registry for the duration of its
//! worker, so a status snapshot can list what is being worked on without touching the queue.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightItem {
    pub queue: &'static str,
    pub item: String,
    pub started: std::time::Instant,
}

/// Registry of items currently held by workers, across all queues.
#[derive(Debug, Default)]
pub struct InFlight {
    next_id: AtomicU64,
    items: std::sync::Mutex<std::collections::BTreeMap<u64, InFlightItem>>,
}

pub struct InFlightGuard {
    registry: std::sync::Arc<InFlight>,
    id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.items().remove(&self.id);
    }
}

impl InFlight {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn items(&self) -> std::sync::MutexGuard<'_, std::collections::BTreeMap<u64, InFlightItem>> {
        self.items
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn register(
        self: &std::sync::Arc<Self>,
        queue: &'static str,
        item: String,
    ) -> InFlightGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.items().insert(
            id,
            InFlightItem {
                queue,
                item,
                started: std::time::Instant::now(),
            },
        );
        InFlightGuard {
            registry: std::sync::Arc::clone(self),
            id,
        }
    }

    /// Items in flight, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<InFlightItem> {
        self.items().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct BoundedQueue {
    name: &'static str,
    limit: usize,
    in_flight: std::sync::Arc<InFlight>,
}

impl BoundedQueue {
    /// A queue running at most `limit` workers at once; a limit of 0 is treated as 1.
    pub fn new(name: &'static str, limit: usize, in_flight: std::sync::Arc<InFlight>) -> Self {
        Self {
            name,
            limit: limit.max(1),
            in_flight,
        }
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Runs `worker` on every item and waits for all of them to finish.
    ///
    /// Worker failures are the worker's business and should be reported through its output; an
    /// `Err` here means a worker task panicked. The queue may be reused for another round.
    pub async fn run_all<T, R, W, Fut>(
        &self,
        items: impl IntoIterator<Item = T>,
        worker: W,
    ) -> anyhow::Result<Vec<R>>
    where
        T: std::fmt::Display,
        W: Fn(T) -> Fut,
        Fut: std::future::Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let mut join_set = tokio::task::JoinSet::new();
        let mut results = vec![];
        for item in items {
            while join_set.len() >= self.limit {
                if let Some(res) = join_set.join_next().await {
                    results.push(res.with_context(|| format!("{} worker failed", self.name))?);
                }
            }
            let guard = self.in_flight.register(self.name, item.to_string());
            let work = worker(item);
            join_set.spawn(async move {
                let _guard = guard;
                work.await
            });
        }
        while let Some(res) = join_set.join_next().await {
            results.push(res.with_context(|| format!("{} worker failed", self.name))?);
        }
        tracing::debug!("{} queue drained, {} items", self.name, results.len());
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn never_exceeds_limit() -> anyhow::Result<()> {
        let queue = BoundedQueue::new("test", 3, Arc::new(InFlight::new()));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let results = queue
            .run_all(0..20, |n: i32| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    n * 2
                }
            })
            .await?;
        assert_eq!(results.len(), 20);
        let mut sorted = results.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..20).map(|n| n * 2).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(active.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    async fn in_flight_items_are_visible() -> anyhow::Result<()> {
        let in_flight = Arc::new(InFlight::new());
        let queue = BoundedQueue::new("blocked", 2, Arc::clone(&in_flight));
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let worker_gate = Arc::clone(&gate);
        let run = tokio::spawn(async move {
            queue
                .run_all(vec!["a", "b", "c"], move |item: &'static str| {
                    let gate = Arc::clone(&worker_gate);
                    async move {
                        let _permit = gate.acquire().await;
                        item
                    }
                })
                .await
        });
        while in_flight.len() < 2 {
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
        }
        let snapshot = in_flight.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().all(|item| item.queue == "blocked"));
        assert_eq!(snapshot[0].item, "a");
        assert_eq!(snapshot[1].item, "b");
        gate.add_permits(3);
        let results = run.await??;
        assert_eq!(results.len(), 3);
        assert!(in_flight.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn can_run_again_after_drain() -> anyhow::Result<()> {
        let queue = BoundedQueue::new("rounds", 2, Arc::new(InFlight::new()));
        let first = queue.run_all(vec![1, 2, 3], |n: u32| async move { n }).await?;
        let second = queue.run_all(vec![4, 5], |n: u32| async move { n }).await?;
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 2);
        let empty = queue
            .run_all(Vec::<u32>::new(), |n: u32| async move { n })
            .await?;
        assert!(empty.is_empty());
        Ok(())
    }

    #[test]
    fn zero_limit_means_one() {
        assert_eq!(BoundedQueue::new("q", 0, Arc::new(InFlight::new())).limit(), 1);
    }
}
