use ahash::AHashSet as HashSet;
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::affinity::NodeId;

/// Lifecycle status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    /// The transaction accepts enlistments.
    Active,
    /// Commit has started; no further enlistments are accepted.
    Preparing,
    /// The transaction committed.
    Committed,
    /// The transaction rolled back.
    RolledBack,
}

/// One unit of work against the grid.
///
/// A transaction carries a unique version (its logical timestamp), the set
/// of keys enlisted so far, and the identity of the node coordinating it.
/// The enlistment core mutates the enlisted key set on every successful
/// per-key enlistment; commit and rollback are driven by the surrounding
/// transaction layer, outside this core.
pub struct Transaction {
    /// Unique logical timestamp; doubles as the commit version for the
    /// mutations this transaction applies.
    version: u64,
    /// The node coordinating this transaction.
    coordinator: NodeId,
    status: Mutex<TxStatus>,
    enlisted: Mutex<HashSet<String>>,
}

impl Transaction {
    /// Creates a new active transaction.
    pub fn new(version: u64, coordinator: NodeId) -> Self {
        Self {
            version,
            coordinator,
            status: Mutex::new(TxStatus::Active),
            enlisted: Mutex::new(HashSet::new()),
        }
    }

    /// The transaction's unique version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The node coordinating this transaction.
    pub fn coordinator_node(&self) -> NodeId {
        self.coordinator
    }

    /// Current lifecycle status.
    pub fn status(&self) -> TxStatus {
        *self.status.lock()
    }

    /// Whether the transaction still accepts enlistments.
    pub fn is_active(&self) -> bool {
        self.status() == TxStatus::Active
    }

    /// Registers a key whose mutation was enlisted under this transaction.
    pub fn enlist_key(&self, key: &str) {
        self.enlisted.lock().insert(key.to_string());
    }

    /// The keys enlisted so far.
    pub fn enlisted_keys(&self) -> Vec<String> {
        self.enlisted.lock().iter().cloned().collect()
    }

    /// Moves the transaction into the preparing phase. Enlist coordinators
    /// refuse transactions that are no longer active.
    pub fn mark_preparing(&self) {
        let mut status = self.status.lock();
        if *status == TxStatus::Active {
            *status = TxStatus::Preparing;
        }
    }

    /// Marks the transaction committed.
    pub fn mark_committed(&self) {
        debug!("transaction {} committed", self.version);
        *self.status.lock() = TxStatus::Committed;
    }

    /// Marks the transaction rolled back.
    pub fn mark_rolled_back(&self) {
        debug!("transaction {} rolled back", self.version);
        *self.status.lock() = TxStatus::RolledBack;
    }
}
