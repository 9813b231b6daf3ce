use log::debug;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Duration;

use crate::affinity::{Affinity, NodeId};
use crate::coordinator::{EnlistConfig, EnlistCoordinator};
use crate::enlist::PrimaryEnlister;
use crate::errors::{GridError, Result};
use crate::failure::{FailureHandler, TopologyEvent};
use crate::locking::LockTable;
use crate::replication::{BackupMutation, BackupReplicator};
use crate::row_source::RowSource;
use crate::snapshot::VersionClock;
use crate::store::PartitionStore;
use crate::transaction::Transaction;
use crate::transport::{EnlistRequest, EnlistResponse, GridTransport};

/// Per-node configuration.
#[derive(Debug, Clone)]
pub struct GridConfig {
    /// This node's identity.
    pub node_id: NodeId,
    /// How long to wait for one backup acknowledgment.
    pub backup_ack_timeout: Duration,
    /// How many times replication retries after losing a backup.
    pub max_backup_retries: u32,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            backup_ack_timeout: Duration::from_secs(5),
            max_backup_retries: 3,
        }
    }
}

struct Connected {
    transport: Arc<dyn GridTransport>,
    failure: Arc<FailureHandler>,
    enlister: Arc<PrimaryEnlister>,
}

/// One grid node: the entry point of the enlistment core.
///
/// A `Sobek` instance owns the node-local partition store, lock table and
/// version clock, issues transactions, and builds enlist coordinators. It
/// also serves the node-side half of the protocol — enlist sub-batches
/// arriving from remote coordinators and backup mutations arriving from
/// remote primaries — which the hosting transport wires to
/// [Sobek::handle_enlist] and [Sobek::handle_replicate].
pub struct Sobek {
    config: GridConfig,
    clock: Arc<VersionClock>,
    store: Arc<PartitionStore>,
    locks: Arc<LockTable>,
    affinity: Arc<dyn Affinity>,
    topology: broadcast::Sender<TopologyEvent>,
    connected: RwLock<Option<Connected>>,
}

impl Sobek {
    /// Creates a new node over the given partition mapping. The node cannot
    /// enlist until [Sobek::connect] supplies a transport.
    pub fn new(config: GridConfig, affinity: Arc<dyn Affinity>) -> Self {
        let (topology, _) = broadcast::channel(64);
        Self {
            config,
            clock: Arc::new(VersionClock::new()),
            store: Arc::new(PartitionStore::new()),
            locks: Arc::new(LockTable::new()),
            affinity,
            topology,
            connected: RwLock::new(None),
        }
    }

    /// Wires the node to the cluster messaging collaborator.
    pub fn connect(&self, transport: Arc<dyn GridTransport>) {
        let failure = Arc::new(FailureHandler::new(
            Arc::clone(&self.affinity),
            self.config.node_id,
            self.config.max_backup_retries,
        ));
        let replicator = Arc::new(BackupReplicator::new(
            Arc::clone(&self.affinity),
            Arc::clone(&transport),
            Arc::clone(&failure),
            self.config.backup_ack_timeout,
        ));
        let enlister = Arc::new(PrimaryEnlister::new(
            Arc::clone(&self.locks),
            Arc::clone(&self.store),
            replicator,
            Arc::clone(&self.affinity),
        ));
        debug!("node {} connected", self.config.node_id);
        *self.connected.write() = Some(Connected {
            transport,
            failure,
            enlister,
        });
    }

    /// This node's identity.
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// The node-local partition store.
    pub fn store(&self) -> &Arc<PartitionStore> {
        &self.store
    }

    /// The node-local lock table.
    pub fn locks(&self) -> &Arc<LockTable> {
        &self.locks
    }

    /// The node-local version clock.
    pub fn clock(&self) -> &Arc<VersionClock> {
        &self.clock
    }

    /// Publishes a topology change to every in-flight coordinator on this
    /// node. Called by the hosting discovery mechanism.
    pub fn publish_topology(&self, event: TopologyEvent) {
        let _ = self.topology.send(event);
    }

    /// Starts a new transaction coordinated by this node.
    pub fn begin_transaction(&self) -> Arc<Transaction> {
        let version = self.clock.next_tx_version();
        debug!("node {} started tx {}", self.config.node_id, version);
        Arc::new(Transaction::new(version, self.config.node_id))
    }

    /// Builds an enlist coordinator for `source` under `tx`, snapshotting
    /// the clock now. The caller drives it with
    /// [EnlistCoordinator::run].
    pub fn enlist<S: RowSource>(
        &self,
        tx: Arc<Transaction>,
        source: S,
        cfg: EnlistConfig,
    ) -> Result<EnlistCoordinator<S>> {
        let connected = self.connected.read();
        let Some(connected) = connected.as_ref() else {
            return Err(GridError::Other(format!(
                "node {} is not connected to a transport",
                self.config.node_id
            )));
        };
        Ok(EnlistCoordinator::new(
            tx,
            source,
            self.clock.snapshot(),
            cfg,
            self.config.node_id,
            Arc::clone(&connected.enlister),
            Arc::clone(&self.affinity),
            Arc::clone(&connected.transport),
            Arc::clone(&connected.failure),
            self.topology.subscribe(),
        ))
    }

    /// Serves an enlist sub-batch arriving from a remote coordinator.
    pub async fn handle_enlist(&self, request: EnlistRequest) -> Result<EnlistResponse> {
        let enlister = {
            let connected = self.connected.read();
            let Some(connected) = connected.as_ref() else {
                return Err(GridError::Other(format!(
                    "node {} is not connected to a transport",
                    self.config.node_id
                )));
            };
            Arc::clone(&connected.enlister)
        };
        self.clock.observe(request.tx_version);
        enlister.enlist_batch(request).await
    }

    /// Serves a backup mutation arriving from a remote primary.
    pub fn handle_replicate(&self, mutation: BackupMutation) {
        self.clock.observe(mutation.tx_version);
        self.store
            .apply(&mutation.key, mutation.value, mutation.tx_version);
    }
}
