use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// An opaque, monotonically comparable version token.
///
/// Exactly one snapshot is taken per enlist coordinator, at coordinator
/// start. Every previous-value read and every write-conflict check performed
/// while the batch runs uses this version, so the whole batch observes one
/// consistent point-in-time view of the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotVersion(u64);

impl SnapshotVersion {
    /// Wraps a raw version counter value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw counter value backing this snapshot.
    pub fn value(self) -> u64 {
        self.0
    }

    /// Whether a write committed at `version` is visible to this snapshot.
    pub fn sees(self, version: u64) -> bool {
        version <= self.0
    }
}

/// A globally increasing logical clock for transaction versions and
/// snapshots.
///
/// Transaction versions double as commit versions for the mutations a
/// transaction applies: a snapshot taken before a transaction was assigned
/// its version never observes that transaction's writes.
pub struct VersionClock {
    counter: AtomicU64,
}

impl VersionClock {
    /// Creates a new clock starting at zero.
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Assigns the next transaction version.
    pub fn next_tx_version(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Takes a snapshot of everything committed so far.
    pub fn snapshot(&self) -> SnapshotVersion {
        SnapshotVersion(self.counter.load(Ordering::SeqCst))
    }

    /// Advances the clock past an externally observed version, keeping the
    /// local clock monotonic when replicated mutations arrive from peers.
    pub fn observe(&self, version: u64) {
        self.counter.fetch_max(version, Ordering::SeqCst);
    }
}

impl Default for VersionClock {
    fn default() -> Self {
        Self::new()
    }
}
