//! Ember Core - Identity and primitive types for the ember discovery network.
//!
//! This crate provides:
//! - `NodeId` (secp256k1 public key identity) and XOR log-distance
//! - `NodeEndpoint` with the address admission policy
//! - Secret key handling and recoverable signatures
//! - keccak-256 hashing
//! - Wall-clock timestamps for datagram expiry

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod crypto;
pub mod endpoint;
pub mod keys;
pub mod node_id;
pub mod time;

pub use crypto::{keccak256, recover_public, sign_recoverable, CryptoError, Hash256};
pub use endpoint::{is_public_address, set_allow_local_peers, NodeEndpoint};
pub use keys::{KeyPair, SecretKey};
pub use node_id::{log_distance, NodeId};
pub use time::Timestamp;

/// Discovery protocol version carried in PING packets.
pub const PROTOCOL_VERSION: u32 = 4;
