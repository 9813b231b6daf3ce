use futures::future::join_all;
use log::debug;
use std::sync::Arc;
use tokio::time::Instant;

use crate::EnlistOperation;
use crate::affinity::Affinity;
use crate::aggregate::{EnlistOutcome, InvokeOutcome};
use crate::errors::{GridError, Result};
use crate::locking::{LockHandle, LockOwner, LockRequest, LockTable, sort_for_locking};
use crate::replication::{BackupMutation, BackupReplicator};
use crate::row_source::{EnlistItem, EnlistPayload, EntryFilter};
use crate::snapshot::SnapshotVersion;
use crate::store::PartitionStore;
use crate::transport::{EnlistRequest, EnlistResponse};

/// Executes enlist sub-batches on the node that primarily owns their
/// partitions: acquires the key locks in the deterministic order, applies
/// each operation under the batch snapshot, and propagates applied
/// mutations to the backups before reporting the outcome.
pub struct PrimaryEnlister {
    locks: Arc<LockTable>,
    store: Arc<PartitionStore>,
    replicator: Arc<BackupReplicator>,
    affinity: Arc<dyn Affinity>,
}

impl PrimaryEnlister {
    pub fn new(
        locks: Arc<LockTable>,
        store: Arc<PartitionStore>,
        replicator: Arc<BackupReplicator>,
        affinity: Arc<dyn Affinity>,
    ) -> Self {
        Self {
            locks,
            store,
            replicator,
            affinity,
        }
    }

    /// Enlists one sub-batch.
    ///
    /// Locks are acquired sequentially in the key-derived total order, then
    /// the locked entries are applied and replicated concurrently, each
    /// releasing its lock as its outcome settles. A lock failure is recorded
    /// as a failed outcome for that key, unless the batch is atomic, in
    /// which case every lock acquired so far is given back and the whole
    /// sub-batch fails.
    pub async fn enlist_batch(&self, mut request: EnlistRequest) -> Result<EnlistResponse> {
        sort_for_locking(&mut request.items);

        let started = Instant::now();
        let mut outcomes = Vec::with_capacity(request.items.len());
        let mut locked = Vec::new();

        let owner = LockOwner {
            tx_version: request.tx_version,
            node: request.coordinator,
        };
        for item in request.items.drain(..) {
            let elapsed = started.elapsed().as_millis() as u64;
            let lock_request = LockRequest {
                key: item.key.clone(),
                owner,
                timeout_ms: request.timeout_ms.saturating_sub(elapsed),
            };
            match self.locks.acquire(lock_request).await {
                Ok(handle) => locked.push((item, handle)),
                Err(err @ (GridError::LockTimeout(_) | GridError::LockDeadlockAvoided(_))) => {
                    if request.atomic {
                        // Partial locks drop here, before the failure is
                        // reported.
                        return Err(err);
                    }
                    debug!("key {} failed to lock: {}", item.key, err);
                    outcomes.push((item.key, EnlistOutcome::failed(err)));
                }
                Err(err) => return Err(err),
            }
        }

        let applied = join_all(locked.into_iter().map(|(item, handle)| {
            self.apply_one(
                item,
                handle,
                request.snapshot,
                request.tx_version,
                request.needs_previous,
                request.filter.clone(),
            )
        }))
        .await;
        outcomes.extend(applied);

        Ok(EnlistResponse { outcomes })
    }

    /// Applies one locked item under the batch snapshot and replicates the
    /// mutation. The lock is held for the whole apply-and-replicate span and
    /// released when the outcome settles, on every path.
    async fn apply_one(
        &self,
        item: EnlistItem,
        handle: LockHandle,
        snapshot: SnapshotVersion,
        tx_version: u64,
        needs_previous: bool,
        filter: Option<Arc<dyn EntryFilter>>,
    ) -> (String, EnlistOutcome) {
        let key = item.key;
        let partition = self.affinity.partition_of(&key);
        let previous = self.store.read_at(&key, snapshot);
        let reported = if needs_previous {
            previous.clone()
        } else {
            None
        };

        // Write-conflict check: a commit newer than the batch snapshot means
        // the read this operation is based on is stale.
        if self.store.latest_version(&key) > snapshot.value() {
            debug!("key {} conflicts with a write past snapshot {:?}", key, snapshot);
            drop(handle);
            return (key, EnlistOutcome::applied(false, reported));
        }

        if let Some(filter) = &filter {
            if !filter.matches(&key, previous.as_deref()) {
                drop(handle);
                return (key, EnlistOutcome::applied(false, reported));
            }
        }

        let mut invoke = None;
        let new_value = match (item.op, item.payload) {
            (EnlistOperation::Insert, EnlistPayload::Row(row)) => {
                if previous.is_some() {
                    drop(handle);
                    return (key, EnlistOutcome::applied(false, reported));
                }
                Some(Some(row))
            }
            (EnlistOperation::Update, EnlistPayload::Row(row)) => {
                if previous.is_none() {
                    drop(handle);
                    return (key, EnlistOutcome::applied(false, reported));
                }
                Some(Some(row))
            }
            (EnlistOperation::Upsert, EnlistPayload::Row(row)) => Some(Some(row)),
            (EnlistOperation::Delete, _) => {
                if previous.is_none() {
                    drop(handle);
                    return (key, EnlistOutcome::applied(false, reported));
                }
                Some(None)
            }
            (EnlistOperation::Invoke, EnlistPayload::Processor(processor)) => {
                match processor.process(&key, previous.as_deref()) {
                    Ok(Some(row)) => {
                        let row = Arc::new(row);
                        invoke = Some(InvokeOutcome {
                            result: Some(Arc::clone(&row)),
                            error: None,
                        });
                        Some(Some(row))
                    }
                    Ok(None) => {
                        invoke = Some(InvokeOutcome {
                            result: None,
                            error: None,
                        });
                        // A processor returning nothing deletes an existing
                        // entry and is a no-op otherwise.
                        previous.is_some().then_some(None)
                    }
                    Err(err) => {
                        // Processor errors are per-key results, not entry
                        // failures.
                        drop(handle);
                        let invoke = InvokeOutcome {
                            result: None,
                            error: Some(err.to_string()),
                        };
                        return (key, EnlistOutcome::invoked(invoke, reported));
                    }
                }
            }
            (op, payload) => {
                drop(handle);
                return (
                    key,
                    EnlistOutcome::failed(GridError::Other(format!(
                        "operation {op:?} cannot carry payload {payload:?}"
                    ))),
                );
            }
        };

        if let Some(value) = new_value {
            self.store.apply(&key, value.clone(), tx_version);
            let mutation = BackupMutation {
                key: key.clone(),
                value,
                tx_version,
            };
            if let Err(err) = self.replicator.replicate(partition, mutation).await {
                // Applied locally but not durable on the backups; the
                // surrounding transaction decides whether to undo siblings.
                drop(handle);
                return (key, EnlistOutcome::failed(err));
            }
        }

        drop(handle);
        let outcome = match invoke {
            Some(invoke) => EnlistOutcome::invoked(invoke, reported),
            None => EnlistOutcome::applied(true, reported),
        };
        (key, outcome)
    }
}
