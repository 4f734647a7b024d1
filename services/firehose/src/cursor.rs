//! Watch cursor shared between the watcher and the checkpoint persister.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Snapshot of the watcher's progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchCursor {
    /// Orchestrator change index of the last processed listing.
    pub poll_index: u64,

    /// High-water mark over emitted task event timestamps (epoch nanos).
    pub last_change_time: i64,
}

/// Cursor written by the watcher and read by the persister.
///
/// Readers may observe a slightly stale value; both fields only move forward.
#[derive(Debug, Default)]
pub struct SharedCursor {
    poll_index: AtomicU64,
    last_change_time: AtomicI64,
}

impl SharedCursor {
    pub fn new(initial: WatchCursor) -> Self {
        Self {
            poll_index: AtomicU64::new(initial.poll_index),
            last_change_time: AtomicI64::new(initial.last_change_time),
        }
    }

    pub fn poll_index(&self) -> u64 {
        self.poll_index.load(Ordering::Acquire)
    }

    pub fn last_change_time(&self) -> i64 {
        self.last_change_time.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> WatchCursor {
        WatchCursor {
            poll_index: self.poll_index(),
            last_change_time: self.last_change_time(),
        }
    }

    /// Move the cursor forward. Neither field ever decreases.
    pub fn advance(&self, poll_index: u64, last_change_time: i64) {
        self.last_change_time
            .fetch_max(last_change_time, Ordering::AcqRel);
        self.poll_index.fetch_max(poll_index, Ordering::AcqRel);
    }
}
