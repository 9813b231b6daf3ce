//! Common utilities for Sobek integration tests.

#![allow(dead_code)]

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use arrow::array::{Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use sobek::{
    BackupMutation, BatchRowSource, EnlistConfig, EnlistItem, EnlistOperation, EnlistRequest,
    EnlistResponse, GridConfig, GridError, GridTransport, NodeId, Result, Sobek, StaticAffinity,
};
use std::sync::Arc;

pub const PARTITIONS: u32 = 16;

// --- LocalTransport ---

/// In-process [GridTransport] routing requests between registered nodes.
/// Nodes marked down answer every request with `PeerLost`.
pub struct LocalTransport {
    nodes: RwLock<HashMap<NodeId, Arc<Sobek>>>,
    down: RwLock<HashSet<NodeId>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            down: RwLock::new(HashSet::new()),
        }
    }

    pub fn register(&self, node: Arc<Sobek>) {
        self.nodes.write().insert(node.node_id(), node);
    }

    /// Simulates losing a node: all traffic to it fails from now on.
    pub fn kill(&self, node: NodeId) {
        self.down.write().insert(node);
    }
}

impl GridTransport for LocalTransport {
    fn enlist(
        &self,
        target: NodeId,
        request: EnlistRequest,
    ) -> BoxFuture<'static, Result<EnlistResponse>> {
        if self.down.read().contains(&target) {
            return Box::pin(async move { Err(GridError::PeerLost(target)) });
        }
        let node = self.nodes.read().get(&target).cloned();
        Box::pin(async move {
            match node {
                Some(node) => node.handle_enlist(request).await,
                None => Err(GridError::PeerLost(target)),
            }
        })
    }

    fn replicate(
        &self,
        target: NodeId,
        mutation: BackupMutation,
    ) -> BoxFuture<'static, Result<()>> {
        if self.down.read().contains(&target) {
            return Box::pin(async move { Err(GridError::PeerLost(target)) });
        }
        let node = self.nodes.read().get(&target).cloned();
        Box::pin(async move {
            match node {
                Some(node) => {
                    node.handle_replicate(mutation);
                    Ok(())
                }
                None => Err(GridError::PeerLost(target)),
            }
        })
    }
}

// --- Cluster setup ---

/// Builds a cluster of `node_ids.len()` connected nodes over a shared
/// affinity that maps every partition to `primary` with the given backups.
pub fn setup_cluster(
    node_ids: &[NodeId],
    primary: NodeId,
    backups: Vec<NodeId>,
) -> (Vec<Arc<Sobek>>, Arc<StaticAffinity>, Arc<LocalTransport>) {
    let affinity = Arc::new(StaticAffinity::new(PARTITIONS, primary, backups));
    let transport = Arc::new(LocalTransport::new());
    let mut nodes = Vec::new();
    for &node_id in node_ids {
        let config = GridConfig {
            node_id,
            ..GridConfig::default()
        };
        let node = Arc::new(Sobek::new(config, affinity.clone()));
        transport.register(node.clone());
        nodes.push(node);
    }
    for node in &nodes {
        node.connect(transport.clone());
    }
    (nodes, affinity, transport)
}

/// Finds a node in the cluster by id.
pub fn node(nodes: &[Arc<Sobek>], id: NodeId) -> Arc<Sobek> {
    nodes
        .iter()
        .find(|n| n.node_id() == id)
        .cloned()
        .expect("node not registered")
}

/// Writes `(key, id, value)` triples through a full upsert batch driven by
/// `node`, so seeded data went through the same lock-apply-replicate path
/// the tests exercise.
pub async fn seed(node: &Arc<Sobek>, entries: &[(&str, i64, &str)]) {
    let items = entries
        .iter()
        .map(|(key, id, value)| EnlistItem::upsert(*key, row(*id, value)))
        .collect();
    let source = BatchRowSource::new(EnlistOperation::Upsert, items, false);
    let tx = node.begin_transaction();
    let mut coordinator = node.enlist(tx, source, EnlistConfig::default()).unwrap();
    let result = coordinator.run().await.unwrap();
    assert!(result.success, "seeding failed");
}

// --- Row helpers ---

/// Helper function to create a simple schema.
pub fn create_test_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Int64, false),
        Field::new("value", DataType::Utf8, true),
    ]))
}

/// Helper function to create a RecordBatch.
pub fn create_record_batch(ids: Vec<i64>, values: Vec<Option<&str>>) -> Arc<RecordBatch> {
    let schema = create_test_schema();
    Arc::new(
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(StringArray::from(values)),
            ],
        )
        .unwrap(),
    )
}

/// Single-row batch with the given id and value.
pub fn row(id: i64, value: &str) -> Arc<RecordBatch> {
    create_record_batch(vec![id], vec![Some(value)])
}

/// The `value` column of a single-row batch.
pub fn value_of(batch: &RecordBatch) -> String {
    batch
        .column(1)
        .as_any()
        .downcast_ref::<StringArray>()
        .unwrap()
        .value(0)
        .to_string()
}
