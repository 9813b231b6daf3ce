pub mod errors;
pub mod snapshot;
pub mod store;
pub mod affinity;
pub mod row_source;
pub mod locking;
pub mod transaction;
pub mod aggregate;
pub mod replication;
pub mod failure;
pub mod transport;
pub mod enlist;
pub mod coordinator;
pub mod sobek;

// Re-export key types and structs for easier access
pub use errors::{GridError, Result};
pub use snapshot::{SnapshotVersion, VersionClock};
pub use store::{PartitionStore, VersionedValue};
pub use affinity::{Affinity, NodeId, PartitionId, StaticAffinity};
pub use row_source::{BatchRowSource, EnlistItem, EnlistPayload, EntryFilter, EntryProcessor, RowSource};
pub use locking::{LockHandle, LockOwner, LockRequest, LockTable};
pub use transaction::{Transaction, TxStatus};
pub use aggregate::{AggregateResult, EnlistOutcome, InvokeOutcome, ResultAggregator};
pub use replication::{BackupMutation, BackupReplicator};
pub use failure::{FailureAction, FailureHandler, TopologyEvent};
pub use transport::{EnlistRequest, EnlistResponse, GridTransport};
pub use coordinator::{CancelHandle, CoordinatorState, EnlistConfig, EnlistCoordinator};
pub use sobek::{GridConfig, Sobek};

// Define the EnlistOperation enum here as it's a core part of the public API
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
///
/// The kind of per-key mutation carried by an enlistment batch.
pub enum EnlistOperation {
    ///
    /// [EnlistOperation::Insert] creates the entry and fails the key if a value
    /// already exists at the batch snapshot.
    Insert,
    ///
    /// [EnlistOperation::Update] replaces the existing value and fails the key
    /// if no value exists at the batch snapshot.
    Update,
    ///
    /// [EnlistOperation::Upsert] writes the value unconditionally.
    Upsert,
    ///
    /// [EnlistOperation::Delete] removes the entry and fails the key if no
    /// value exists at the batch snapshot.
    Delete,
    ///
    /// [EnlistOperation::Invoke] runs an entry processor against the previous
    /// value and writes whatever the processor returns. Each key reports its
    /// own processor result or error in the aggregate.
    Invoke,
}

impl EnlistOperation {
    /// Returns `true` for operations that remove the entry.
    pub fn is_delete(self) -> bool {
        self == EnlistOperation::Delete
    }

    /// Returns `true` for entry-processor batches, which report per-key
    /// results rather than a single representative previous value.
    pub fn is_invoke(self) -> bool {
        self == EnlistOperation::Invoke
    }
}
