use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::affinity::{Affinity, NodeId};
use crate::errors::GridError;

/// A cluster topology change, delivered to in-flight coordinators over a
/// broadcast channel by whatever discovery mechanism hosts the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyEvent {
    NodeJoined(NodeId),
    NodeLeft(NodeId),
}

/// What an in-flight coordinator should do about an observed failure.
#[derive(Debug)]
pub enum FailureAction {
    /// No in-flight work is affected.
    Ignore,
    /// A backup replica may be gone; replication retries against the
    /// refreshed backup set.
    RetryBackups,
    /// The coordinator must stop with the given classified error.
    Fatal(GridError),
    /// The requesting client is gone; cancel quietly and release locks.
    Cancel,
}

/// Classifies topology changes and node-loss signals for one coordinator.
///
/// Classification policy:
/// - losing a backup of an in-flight key: bounded replication retries
///   against the refreshed backup set, then that key fails;
/// - losing the primary of an in-flight key: fatal for the whole
///   coordinator, surfaced as the retriable [GridError::OwnershipChanged];
/// - losing the requesting node: cancel and release, nothing surfaced.
pub struct FailureHandler {
    affinity: Arc<dyn Affinity>,
    /// The near node that submitted the batch.
    requesting_node: NodeId,
    max_backup_retries: u32,
}

impl FailureHandler {
    pub fn new(affinity: Arc<dyn Affinity>, requesting_node: NodeId, max_backup_retries: u32) -> Self {
        Self {
            affinity,
            requesting_node,
            max_backup_retries,
        }
    }

    /// Classifies a topology event against the primaries currently serving
    /// this coordinator's in-flight keys.
    pub fn classify(&self, event: TopologyEvent, in_flight_primaries: &[NodeId]) -> FailureAction {
        match event {
            TopologyEvent::NodeJoined(node) => {
                debug!("node {} joined, topology {}", node, self.affinity.topology_version());
                FailureAction::Ignore
            }
            TopologyEvent::NodeLeft(node) if node == self.requesting_node => {
                warn!("requesting node {} left, cancelling enlistment", node);
                FailureAction::Cancel
            }
            TopologyEvent::NodeLeft(node) if in_flight_primaries.contains(&node) => {
                warn!("primary {} left mid-enlistment", node);
                FailureAction::Fatal(GridError::OwnershipChanged)
            }
            TopologyEvent::NodeLeft(node) => {
                debug!("node {} left, backup sets may have changed", node);
                FailureAction::RetryBackups
            }
        }
    }

    /// Classifies the loss of a peer an enlist request was dispatched to.
    /// Losing a primary always invalidates the routing of the whole batch.
    pub fn classify_peer_lost(&self, peer: NodeId, was_primary: bool) -> GridError {
        if was_primary {
            warn!("primary {} lost during enlist dispatch", peer);
            GridError::OwnershipChanged
        } else {
            GridError::PeerLost(peer)
        }
    }

    /// Whether replication should retry after losing a backup.
    pub fn should_retry_backup(&self, attempts: u32) -> bool {
        attempts < self.max_backup_retries
    }
}
