use thiserror::Error;

use crate::affinity::NodeId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GridError {
    #[error("row source failed: {0}")]
    SourceError(String),

    #[error("lock acquisition timed out for key {0}")]
    LockTimeout(String),

    #[error("lock acquisition aborted to avoid deadlock for key {0}")]
    LockDeadlockAvoided(String),

    #[error("backup replication failed for key {key}: {reason}")]
    BackupReplicationFailed { key: String, reason: String },

    #[error("partition ownership changed during enlistment")]
    OwnershipChanged,

    #[error("peer node {0} lost")]
    PeerLost(NodeId),

    #[error("enlistment cancelled")]
    Cancelled,

    #[error("aggregate result is not ready")]
    ResultNotReady,

    #[error("duplicate outcome recorded for key {0}")]
    DuplicateOutcome(String),

    #[error("other error: {0}")]
    Other(String),
}

impl GridError {
    /// Whether the caller may recompute partition ownership and resubmit the
    /// whole batch. Per-key failures are reported through outcomes instead and
    /// never surface here.
    pub fn is_retriable(&self) -> bool {
        matches!(self, GridError::OwnershipChanged)
    }
}

pub type Result<T> = std::result::Result<T, GridError>;
