//! Bounded pool for background network work.
//!
//! Image dials and non-waiting handshakes run here rather than on the
//! caller's task.  Each job is a spawned Tokio task that first takes a
//! semaphore permit, so at most `size` jobs make progress at once and the
//! rest queue in FIFO order.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Creates a pool running at most `size` jobs concurrently (minimum 1).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Queues `job`.  It starts once a permit is free.
    ///
    /// Jobs still queued when the pool is [closed](WorkerPool::close) are
    /// dropped without running.
    pub fn spawn<F>(&self, job: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                debug!("worker pool closed; dropping queued job");
                return;
            };
            job.await;
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits not currently held by a running job.
    pub fn idle_workers(&self) -> usize {
        self.permits.available_permits()
    }

    /// Stops admitting queued jobs.  Running jobs finish normally.
    pub fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_pool_never_exceeds_its_size() {
        // Arrange
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        // Act
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                pool.spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }

        // Assert
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.idle_workers(), 2);
    }

    #[tokio::test]
    async fn test_closed_pool_drops_queued_jobs() {
        let pool = WorkerPool::new(1);
        pool.close();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);

        pool.spawn(async move {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_zero_size_is_raised_to_one() {
        assert_eq!(WorkerPool::new(0).size(), 1);
    }
}
