//! Ember DHT - Kademlia-style peer discovery.
//!
//! Maintains a bounded routing table of peers ordered by XOR log-distance,
//! probes liveness with signed PING/PONG exchanges, resolves full buckets
//! through eviction challenges, and continuously discovers new peers with
//! iterative FIND_NODE lookups toward random targets.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

use std::time::Duration;

pub mod eviction;
pub mod events;
pub mod node;
pub mod routing;
pub mod table;
pub mod timers;

pub use events::{NodeEventHandler, NodeEventKind};
pub use node::{Node, NodeEntry, NodeRelation, PeerType};
pub use table::{NodeTable, NodeTableConfig};

/// Number of buckets: one per possible XOR log-distance.
pub const BUCKET_COUNT: usize = 256;

/// Bucket capacity (the Kademlia `k`).
pub const BUCKET_SIZE: usize = 16;

/// Concurrent FIND_NODE queries per lookup round (the Kademlia `alpha`).
pub const DISCOVERY_PARALLELISM: usize = 3;

/// Maximum rounds per iterative lookup.
pub const DISCOVERY_MAX_ROUNDS: usize = 8;

/// How long a peer has to answer a request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(300);

/// Delay between the end of one random lookup and the start of the next.
pub const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_millis(7200);

/// Cadence of the eviction timeout sweep while challenges are outstanding.
pub const EVICTION_CHECK_INTERVAL: Duration = Duration::from_millis(75);
