//! Bounded pool of blocking workers shared by every pipeline stage.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::{ImportError, Result};

/// Runs blocking tasks on at most `size` threads at a time.
///
/// Each submitted task holds a semaphore permit for its whole run on the
/// blocking thread pool. Closing the pool makes further submissions fail.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `task` over every item and wait until all of them finish.
    ///
    /// Results come back in submission order. An error here means the stage
    /// could not run at all: the pool was shut down or a task panicked.
    pub async fn run_all<T, R, F>(&self, items: Vec<T>, task: F) -> Result<Vec<R>>
    where
        T: Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> R + Send + Sync + 'static,
    {
        let task = Arc::new(task);
        let mut handles = Vec::with_capacity(items.len());
        for item in items {
            let permit = Arc::clone(&self.permits)
                .acquire_owned()
                .await
                .map_err(|e| ImportError::pool(e, "submitting work to the worker pool"))?;
            let task = Arc::clone(&task);
            handles.push(tokio::task::spawn_blocking(move || {
                let _permit = permit;
                task(item)
            }));
        }
        debug!("Waiting for {} tasks", handles.len());

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(
                handle
                    .await
                    .map_err(|e| ImportError::pool(e, "waiting for a worker task"))?,
            );
        }
        Ok(results)
    }

    /// Refuse further work.
    pub fn shutdown(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_keep_submission_order() {
        let pool = WorkerPool::new(3);
        let results = pool
            .run_all((0..10).collect(), |n: u64| {
                std::thread::sleep(Duration::from_millis(10 - n));
                n * 2
            })
            .await
            .unwrap();
        assert_eq!(results, (0..10).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
        pool.run_all((0..8).collect(), move |_: usize| {
            let now = r.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            r.fetch_sub(1, Ordering::SeqCst);
        })
        .await
        .unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_work() {
        let pool = WorkerPool::new(1);
        pool.shutdown();
        let err = pool.run_all(vec![1], |n: i32| n).await.unwrap_err();
        assert!(matches!(err, ImportError::Pool { .. }));
        // nothing submitted, nothing to refuse
        assert!(pool.run_all(Vec::<i32>::new(), |n| n).await.unwrap().is_empty());
    }

    #[test]
    fn test_size_at_least_one() {
        assert_eq!(WorkerPool::new(0).size(), 1);
    }
}
