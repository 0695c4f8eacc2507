//! Progress tracking for top-level batch operations.
//!
//! Export/import and other whole-volume operations report per-block progress
//! through a [`BatchTracker`] and honor its cooperative cancellation flag:
//! once cancelled, the operation stops issuing new block requests, cancels
//! in-flight ones, and releases partially written output.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// A progress update event.
#[derive(Debug, Clone)]
pub enum BatchUpdate {
    /// The operation has started.
    Started { total_blocks: usize },
    /// One block has been processed.
    BlockCompleted { index: usize, total: usize },
    /// Overall progress.
    Progress { percent: f32, elapsed_ms: u64 },
    /// The operation completed.
    Completed {
        blocks_processed: usize,
        total_duration_ms: u64,
    },
    /// The operation was cancelled.
    Cancelled,
    /// An error occurred.
    Error { message: String },
}

/// Callback type for progress updates.
pub type BatchCallback = Box<dyn Fn(BatchUpdate) + Send + Sync>;

/// Tracks a batch operation over cache blocks and allows cancellation.
pub struct BatchTracker {
    total_blocks: usize,
    completed: AtomicU64,
    cancelled: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    callback: Option<BatchCallback>,
}

impl BatchTracker {
    /// Create a tracker for `total_blocks` blocks.
    pub fn new(total_blocks: usize) -> Self {
        Self {
            total_blocks,
            completed: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            started_at: Mutex::new(None),
            callback: None,
        }
    }

    /// Create a shared tracker.
    pub fn new_shared(total_blocks: usize) -> Arc<Self> {
        Arc::new(Self::new(total_blocks))
    }

    /// Attach a callback for progress updates.
    pub fn with_callback(mut self, callback: impl Fn(BatchUpdate) + Send + Sync + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Mark the start of the operation.
    pub fn start(&self) {
        *self.started_at.lock() = Some(Instant::now());
        self.send(BatchUpdate::Started {
            total_blocks: self.total_blocks,
        });
    }

    /// Report one completed block.
    pub fn block_completed(&self) {
        let done = self.completed.fetch_add(1, Ordering::Relaxed) as usize + 1;
        self.send(BatchUpdate::BlockCompleted {
            index: done,
            total: self.total_blocks,
        });
        self.send(BatchUpdate::Progress {
            percent: self.progress_percent(),
            elapsed_ms: self.elapsed_ms(),
        });
    }

    /// Whether the operation should stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.send(BatchUpdate::Cancelled);
    }

    /// Report an error.
    pub fn report_error(&self, message: impl Into<String>) {
        self.send(BatchUpdate::Error {
            message: message.into(),
        });
    }

    /// Mark the end of the operation.
    pub fn complete(&self) {
        self.send(BatchUpdate::Completed {
            blocks_processed: self.completed.load(Ordering::Relaxed) as usize,
            total_duration_ms: self.elapsed_ms(),
        });
    }

    /// Current progress percentage.
    pub fn progress_percent(&self) -> f32 {
        if self.total_blocks == 0 {
            return 100.0;
        }
        let done = self.completed.load(Ordering::Relaxed) as f32;
        (done / self.total_blocks as f32) * 100.0
    }

    fn elapsed_ms(&self) -> u64 {
        (*self.started_at.lock())
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0)
    }

    fn send(&self, update: BatchUpdate) {
        if let Some(cb) = &self.callback {
            cb(update);
        }
    }
}

impl Default for BatchTracker {
    fn default() -> Self {
        Self::new(0)
    }
}

impl std::fmt::Debug for BatchTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchTracker")
            .field("total_blocks", &self.total_blocks)
            .field("completed", &self.completed.load(Ordering::Relaxed))
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_progress_calculation() {
        let tracker = BatchTracker::new(4);
        assert_eq!(tracker.progress_percent(), 0.0);
        tracker.block_completed();
        tracker.block_completed();
        assert_eq!(tracker.progress_percent(), 50.0);
    }

    #[test]
    fn test_cancellation_flag() {
        let tracker = BatchTracker::new(4);
        assert!(!tracker.is_cancelled());
        tracker.cancel();
        assert!(tracker.is_cancelled());
    }

    #[test]
    fn test_callback_receives_updates() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let tracker = BatchTracker::new(2).with_callback(move |_| {
            count2.fetch_add(1, Ordering::Relaxed);
        });

        tracker.start();
        tracker.block_completed();
        tracker.complete();
        // Started, BlockCompleted, Progress, Completed.
        assert_eq!(count.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_zero_blocks_is_complete() {
        let tracker = BatchTracker::new(0);
        assert_eq!(tracker.progress_percent(), 100.0);
    }
}
