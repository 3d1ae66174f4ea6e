// src/core/metrics.rs

//! Central counters for the engine. Plain atomics, snapshotted into the
//! status document by the sink task.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    /// Keys written to the target during the snapshot phase.
    pub snapshot_keys: AtomicU64,
    /// Keys the conflict policy skipped because they already existed.
    pub snapshot_keys_skipped: AtomicU64,
    /// Keys dropped before emission because they were already expired.
    pub expired_dropped: AtomicU64,
    /// COMMAND records replayed to the target.
    pub journal_commands: AtomicU64,
    /// EXPIRED records translated into deletes.
    pub journal_expirations: AtomicU64,
    /// Semantic error replies (WRONGTYPE and friends) that were counted and
    /// logged but did not halt replay.
    pub semantic_errors: AtomicU64,
    /// MOVED redirects followed.
    pub redirects_moved: AtomicU64,
    /// ASK redirects followed.
    pub redirects_ask: AtomicU64,
    /// Full topology rebuilds.
    pub topology_refreshes: AtomicU64,
    /// Bytes consumed from FLOW sockets during the snapshot phase.
    pub snapshot_bytes: AtomicU64,
    /// Bytes consumed from FLOW sockets during the journal phase.
    pub journal_bytes: AtomicU64,
    /// Checkpoints written.
    pub checkpoints_saved: AtomicU64,
}

/// A serializable point-in-time copy of the counters.
#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub snapshot_keys: u64,
    pub snapshot_keys_skipped: u64,
    pub expired_dropped: u64,
    pub journal_commands: u64,
    pub journal_expirations: u64,
    pub semantic_errors: u64,
    pub redirects_moved: u64,
    pub redirects_ask: u64,
    pub topology_refreshes: u64,
    pub snapshot_bytes: u64,
    pub journal_bytes: u64,
    pub checkpoints_saved: u64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            snapshot_keys: self.snapshot_keys.load(Ordering::Relaxed),
            snapshot_keys_skipped: self.snapshot_keys_skipped.load(Ordering::Relaxed),
            expired_dropped: self.expired_dropped.load(Ordering::Relaxed),
            journal_commands: self.journal_commands.load(Ordering::Relaxed),
            journal_expirations: self.journal_expirations.load(Ordering::Relaxed),
            semantic_errors: self.semantic_errors.load(Ordering::Relaxed),
            redirects_moved: self.redirects_moved.load(Ordering::Relaxed),
            redirects_ask: self.redirects_ask.load(Ordering::Relaxed),
            topology_refreshes: self.topology_refreshes.load(Ordering::Relaxed),
            snapshot_bytes: self.snapshot_bytes.load(Ordering::Relaxed),
            journal_bytes: self.journal_bytes.load(Ordering::Relaxed),
            checkpoints_saved: self.checkpoints_saved.load(Ordering::Relaxed),
        }
    }
}

/// Relaxed increment helper; every counter here is a statistic, not a
/// synchronization point.
pub fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

pub fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}
