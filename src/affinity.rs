use ahash::RandomState;
use parking_lot::RwLock;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifier of a cluster node.
pub type NodeId = u64;

/// Identifier of a keyspace partition.
pub type PartitionId = u32;

// Fixed seeds so every node maps a key to the same partition and the same
// lock rank.
const AFFINITY_SEEDS: (u64, u64, u64, u64) = (
    0x5153_6f62_656b_0001,
    0x9e37_79b9_7f4a_7c15,
    0xc2b2_ae3d_27d4_eb4f,
    0x1656_67b1_9e37_79f9,
);

/// Hashes a key with the cluster-wide fixed seeds.
pub fn key_hash(key: &str) -> u64 {
    let state = RandomState::with_seeds(
        AFFINITY_SEEDS.0,
        AFFINITY_SEEDS.1,
        AFFINITY_SEEDS.2,
        AFFINITY_SEEDS.3,
    );
    let mut hasher = state.build_hasher();
    key.hash(&mut hasher);
    hasher.finish()
}

/// Partition-to-node mapping, consumed as a given function.
///
/// The enlistment core never computes this mapping itself; it routes every
/// item through whatever implementation the hosting system provides.
pub trait Affinity: Send + Sync {
    /// Maps a key to its partition.
    fn partition_of(&self, key: &str) -> PartitionId;

    /// The node currently owning authoritative reads/writes of a partition,
    /// or `None` when ownership is in flux.
    fn primary(&self, partition: PartitionId) -> Option<NodeId>;

    /// The backup replicas of a partition, excluding the primary.
    fn backups(&self, partition: PartitionId) -> Vec<NodeId>;

    /// A counter bumped on every topology change.
    fn topology_version(&self) -> u64;
}

/// A table-driven [Affinity] with explicit per-partition assignments.
///
/// Reassignments bump the topology version, which is how tests and the
/// failure handler observe primaries moving.
pub struct StaticAffinity {
    partitions: u32,
    /// Index = partition id; (primary, backups). `None` while unassigned.
    assignments: RwLock<Vec<Option<(NodeId, Vec<NodeId>)>>>,
    topology: AtomicU64,
}

impl StaticAffinity {
    /// Creates an affinity over `partitions` partitions, all initially
    /// assigned to `primary` with the given backups.
    pub fn new(partitions: u32, primary: NodeId, backups: Vec<NodeId>) -> Self {
        let assignments = vec![Some((primary, backups)); partitions as usize];
        Self {
            partitions,
            assignments: RwLock::new(assignments),
            topology: AtomicU64::new(1),
        }
    }

    /// Reassigns one partition, bumping the topology version.
    pub fn assign(&self, partition: PartitionId, primary: NodeId, backups: Vec<NodeId>) {
        let mut assignments = self.assignments.write();
        assignments[partition as usize] = Some((primary, backups));
        self.topology.fetch_add(1, Ordering::SeqCst);
    }

    /// Removes a node from every assignment it appears in. Partitions whose
    /// primary was the removed node become unassigned until reassigned.
    pub fn remove_node(&self, node: NodeId) {
        let mut assignments = self.assignments.write();
        for slot in assignments.iter_mut() {
            if let Some((primary, backups)) = slot {
                backups.retain(|b| *b != node);
                if *primary == node {
                    *slot = None;
                }
            }
        }
        self.topology.fetch_add(1, Ordering::SeqCst);
    }
}

impl Affinity for StaticAffinity {
    fn partition_of(&self, key: &str) -> PartitionId {
        (key_hash(key) % self.partitions as u64) as PartitionId
    }

    fn primary(&self, partition: PartitionId) -> Option<NodeId> {
        let assignments = self.assignments.read();
        assignments
            .get(partition as usize)
            .and_then(|slot| slot.as_ref())
            .map(|(primary, _)| *primary)
    }

    fn backups(&self, partition: PartitionId) -> Vec<NodeId> {
        let assignments = self.assignments.read();
        assignments
            .get(partition as usize)
            .and_then(|slot| slot.as_ref())
            .map(|(_, backups)| backups.clone())
            .unwrap_or_default()
    }

    fn topology_version(&self) -> u64 {
        self.topology.load(Ordering::SeqCst)
    }
}
