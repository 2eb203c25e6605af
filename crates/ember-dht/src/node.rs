//! Peer records held by the routing table.

use ember_core::{log_distance, NodeEndpoint, NodeId};
use serde::{Deserialize, Serialize};

/// Whether the upstream peer manager must keep this peer connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PeerType {
    /// Connection is mandatory.
    Required,
    /// Connection is discretionary.
    #[default]
    Optional,
}

/// How a node was introduced to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRelation {
    /// Seeded from a trusted source; placed without a liveness probe.
    Known,
    /// Learned from the network; must answer a PING before placement.
    Unknown,
}

/// A peer identity and location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Public-key identity.
    pub id: NodeId,
    /// Network location.
    pub endpoint: NodeEndpoint,
    /// Connection obligation.
    pub peer_type: PeerType,
}

impl Node {
    /// Creates an optional-peer node.
    pub fn new(id: NodeId, endpoint: NodeEndpoint) -> Self {
        Self {
            id,
            endpoint,
            peer_type: PeerType::Optional,
        }
    }
}

/// A node as tracked by the registry: location plus bucket placement state.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    /// The peer record.
    pub node: Node,
    /// XOR log-distance to the host id; fixed at creation.
    pub distance: u16,
    /// True until the peer's first validated PONG.
    pub pending: bool,
}

impl NodeEntry {
    /// Creates an entry, computing the bucket distance from the host id.
    pub fn new(host_id: &NodeId, node: Node, pending: bool) -> Self {
        let distance = log_distance(host_id, &node.id);
        Self {
            node,
            distance,
            pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_distance_matches_ids() {
        let host = NodeId::random();
        let peer = NodeId::random();
        let endpoint = NodeEndpoint::new("10.0.0.1".parse().unwrap(), 30303, 30303);

        let entry = NodeEntry::new(&host, Node::new(peer, endpoint), true);
        assert_eq!(entry.distance, log_distance(&host, &peer));
        assert!(entry.pending);
    }
}
