//! A discovery node running on a loopback socket for integration tests.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ember_core::{set_allow_local_peers, KeyPair, NodeEndpoint, NodeId};
use ember_dht::{Node, NodeTable, NodeTableConfig};
use tracing::info;

/// A started discovery node bound to an ephemeral loopback port.
pub struct TestNode {
    /// The node's identity.
    pub key_pair: KeyPair,
    /// The running table.
    pub table: Arc<NodeTable>,
}

impl TestNode {
    /// Starts a node on `127.0.0.1` with a fresh identity.
    pub async fn start() -> Self {
        Self::start_with_key(KeyPair::generate()).await
    }

    /// Starts a node on `127.0.0.1` with the given identity.
    ///
    /// Lets tests pick ids with a known XOR distance to another node.
    pub async fn start_with_key(key_pair: KeyPair) -> Self {
        // Loopback peers are rejected by the default admission policy.
        set_allow_local_peers(true);

        let config = NodeTableConfig::new(NodeEndpoint::new("127.0.0.1".parse().unwrap(), 0, 0));
        let table = NodeTable::new(key_pair.clone(), config);
        table.start().await;
        assert!(table.is_open(), "test node failed to bind");

        info!(id = %table.local_id(), endpoint = %table.host_endpoint(), "test node started");
        Self { key_pair, table }
    }

    /// The node's id.
    pub fn node_id(&self) -> NodeId {
        self.table.local_id()
    }

    /// The node's bound endpoint.
    pub fn endpoint(&self) -> NodeEndpoint {
        self.table.host_endpoint()
    }

    /// This node as a peer record for seeding other tables.
    pub fn as_node(&self) -> Node {
        Node::new(self.node_id(), self.endpoint())
    }

    /// Stops the node.
    pub fn shutdown(&self) {
        self.table.shutdown();
    }
}

/// Polls `condition` every 50 ms until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
