//! Run-wide row counters and periodic progress logging.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::info;

/// How often the reporter logs.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Counters shared by every load task.
#[derive(Debug, Default)]
pub struct ProgressCounter {
    pub rows_read: Arc<AtomicU64>,
    pub rows_written: Arc<AtomicU64>,
    pub blob_chunks: Arc<AtomicU64>,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.rows_read.load(Ordering::Relaxed),
            self.rows_written.load(Ordering::Relaxed),
            self.blob_chunks.load(Ordering::Relaxed),
        )
    }

    /// Spawn a task logging the counters every [`REPORT_INTERVAL`] until
    /// aborted.
    pub fn start_reporter(self: &Arc<Self>) -> JoinHandle<()> {
        let counter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REPORT_INTERVAL);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let (read, written, chunks) = counter.snapshot();
                info!(
                    "Progress: {} rows read, {} rows written, {} blob chunks",
                    read, written, chunks
                );
            }
        })
    }

    /// Log the totals and the average write rate since `started`.
    pub fn log_summary(&self, started: Instant) {
        let (read, written, chunks) = self.snapshot();
        let elapsed = started.elapsed().as_secs_f64();
        let rows_per_sec = if elapsed > 0.0 {
            (written as f64 / elapsed) as u64
        } else {
            0
        };
        info!(
            "Load finished: {} rows read, {} rows written, {} blob chunks in {:.1}s ({} rows/s)",
            read, written, chunks, elapsed, rows_per_sec
        );
    }
}
