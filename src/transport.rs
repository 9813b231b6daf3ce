use futures::future::BoxFuture;
use std::sync::Arc;

use crate::affinity::NodeId;
use crate::aggregate::EnlistOutcome;
use crate::errors::Result;
use crate::replication::BackupMutation;
use crate::row_source::{EnlistItem, EntryFilter};
use crate::snapshot::SnapshotVersion;

/// A sub-batch of items dispatched to the primary owner of their
/// partitions. Items arrive pre-sorted in lock acquisition order; the
/// receiving node sorts again before locking, since the order is a
/// correctness invariant, not a courtesy of the sender.
#[derive(Clone)]
pub struct EnlistRequest {
    /// The enlisting transaction's version.
    pub tx_version: u64,
    /// The node coordinating the transaction. Together with `tx_version`
    /// this identifies the transaction globally; versions alone collide
    /// across coordinating nodes.
    pub coordinator: NodeId,
    /// The batch snapshot every read and conflict check uses.
    pub snapshot: SnapshotVersion,
    /// Time remaining in the batch's single timeout budget.
    pub timeout_ms: u64,
    /// Whether previous values must be reported back.
    pub needs_previous: bool,
    /// Whether a per-key failure must abort the whole sub-batch during lock
    /// acquisition.
    pub atomic: bool,
    /// Optional previous-value predicate for the batch.
    pub filter: Option<Arc<dyn EntryFilter>>,
    /// The items to enlist, in lock order.
    pub items: Vec<EnlistItem>,
}

/// Per-key outcomes of an [EnlistRequest].
pub struct EnlistResponse {
    pub outcomes: Vec<(String, EnlistOutcome)>,
}

/// Asynchronous request/response messaging between grid nodes.
///
/// The enlistment core is agnostic to the wire format: lock-and-apply
/// requests and backup replication both go through this collaborator, which
/// the hosting system implements over its own transport. Tests implement it
/// with in-process routing.
pub trait GridTransport: Send + Sync {
    /// Sends a sub-batch to the primary owner `target` and awaits its
    /// per-key outcomes.
    fn enlist(&self, target: NodeId, request: EnlistRequest)
    -> BoxFuture<'static, Result<EnlistResponse>>;

    /// Sends an applied mutation to the backup replica `target` and awaits
    /// its acknowledgment.
    fn replicate(&self, target: NodeId, mutation: BackupMutation)
    -> BoxFuture<'static, Result<()>>;
}
