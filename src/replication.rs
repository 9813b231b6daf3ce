use arrow::record_batch::RecordBatch;
use futures::future::join_all;
use log::{debug, warn};
use std::sync::Arc;
use tokio::time::{Duration, timeout};

use crate::affinity::{Affinity, PartitionId};
use crate::errors::{GridError, Result};
use crate::failure::FailureHandler;
use crate::transport::GridTransport;

/// An applied mutation bound for the backup replicas of a key's partition.
///
/// Owned by the replicator until every backup acknowledged it, then
/// discarded.
#[derive(Clone)]
pub struct BackupMutation {
    pub key: String,
    /// The applied value, or `None` for a deletion.
    pub value: Option<Arc<RecordBatch>>,
    /// The version the mutation was applied at.
    pub tx_version: u64,
}

/// Synchronously propagates applied mutations to backup replicas.
///
/// An outcome is handed to the aggregator only after every backup of the
/// key's partition acknowledged the mutation; a primary failing after local
/// apply but before propagation would otherwise silently lose the update.
pub struct BackupReplicator {
    affinity: Arc<dyn Affinity>,
    transport: Arc<dyn GridTransport>,
    failure: Arc<FailureHandler>,
    ack_timeout: Duration,
}

impl BackupReplicator {
    pub fn new(
        affinity: Arc<dyn Affinity>,
        transport: Arc<dyn GridTransport>,
        failure: Arc<FailureHandler>,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            affinity,
            transport,
            failure,
            ack_timeout,
        }
    }

    /// Replicates one mutation to all backups of `partition` and waits for
    /// every acknowledgment.
    ///
    /// Losing a backup node re-resolves the backup set and retries, up to
    /// the failure handler's retry bound. An acknowledgment timeout fails
    /// the key immediately; whether that aborts sibling keys is the
    /// coordinator's atomicity policy, not this layer's.
    pub async fn replicate(&self, partition: PartitionId, mutation: BackupMutation) -> Result<()> {
        let mut attempts = 0u32;
        loop {
            let backups = self.affinity.backups(partition);
            if backups.is_empty() {
                return Ok(());
            }

            let acks = join_all(backups.iter().map(|backup| {
                timeout(
                    self.ack_timeout,
                    self.transport.replicate(*backup, mutation.clone()),
                )
            }))
            .await;

            let mut lost_backup = None;
            for (backup, ack) in backups.iter().zip(acks) {
                match ack {
                    Ok(Ok(())) => {}
                    Ok(Err(GridError::PeerLost(node))) => {
                        lost_backup = Some(node);
                    }
                    Ok(Err(err)) => {
                        return Err(GridError::BackupReplicationFailed {
                            key: mutation.key.clone(),
                            reason: err.to_string(),
                        });
                    }
                    Err(_) => {
                        warn!(
                            "backup {} did not acknowledge {} within {:?}",
                            backup, mutation.key, self.ack_timeout
                        );
                        return Err(GridError::BackupReplicationFailed {
                            key: mutation.key.clone(),
                            reason: format!("acknowledgment timed out on node {backup}"),
                        });
                    }
                }
            }

            match lost_backup {
                None => return Ok(()),
                Some(node) => {
                    attempts += 1;
                    if !self.failure.should_retry_backup(attempts) {
                        return Err(GridError::BackupReplicationFailed {
                            key: mutation.key.clone(),
                            reason: format!("backup node {node} lost, retries exhausted"),
                        });
                    }
                    debug!(
                        "backup {} lost replicating {}, retry {} against refreshed backup set",
                        node, mutation.key, attempts
                    );
                }
            }
        }
    }
}
