//! Node identity and XOR log-distance.
//!
//! A `NodeId` is the uncompressed secp256k1 public key of a node, without
//! the leading 0x04 tag byte. Distance between two nodes is measured over
//! the keccak-256 hashes of their ids, which spreads ids uniformly across
//! the bucket space regardless of key structure.

use std::fmt;
use std::str::FromStr;

use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::crypto::keccak256;

/// Number of raw bytes in a node id (512-bit public key).
pub const NODE_ID_LENGTH: usize = 64;

/// Node identity: an uncompressed secp256k1 public key sans tag byte.
///
/// Equality and hashing are by raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub [u8; NODE_ID_LENGTH]);

impl NodeId {
    /// Creates a node id from raw bytes.
    pub const fn new(bytes: [u8; NODE_ID_LENGTH]) -> Self {
        Self(bytes)
    }

    /// The all-zero id, used as "unset".
    pub const fn zero() -> Self {
        Self([0u8; NODE_ID_LENGTH])
    }

    /// Returns true if every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Returns the inner bytes.
    pub const fn as_bytes(&self) -> &[u8; NODE_ID_LENGTH] {
        &self.0
    }

    /// Returns the inner bytes as a slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Parses from a 128-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != NODE_ID_LENGTH {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; NODE_ID_LENGTH];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Returns the full hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Generates a random id.
    ///
    /// Not a valid public key; used as a lookup target to stir the table.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; NODE_ID_LENGTH];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl From<[u8; NODE_ID_LENGTH]> for NodeId {
    fn from(bytes: [u8; NODE_ID_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for NodeId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(D::Error::custom)
    }
}

impl Encodable for NodeId {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.append(&self.0.to_vec());
    }
}

impl Decodable for NodeId {
    fn decode(rlp: &Rlp<'_>) -> Result<Self, DecoderError> {
        let bytes: Vec<u8> = rlp.as_val()?;
        if bytes.len() != NODE_ID_LENGTH {
            return Err(DecoderError::Custom("node id must be 64 bytes"));
        }
        let mut arr = [0u8; NODE_ID_LENGTH];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

/// XOR log-distance between two ids, measured over keccak-256 of the raw
/// bytes.
///
/// Returns the 1-based index of the highest-order differing bit of the two
/// hashes, in `1..=256`. Identical ids yield 0, which is reserved for the
/// host itself and never maps to a bucket.
pub fn log_distance(a: &NodeId, b: &NodeId) -> u16 {
    let ha = keccak256(a.as_slice());
    let hb = keccak256(b.as_slice());
    for i in 0..ha.len() {
        let diff = ha[i] ^ hb[i];
        if diff != 0 {
            return 256 - (i as u16) * 8 - diff.leading_zeros() as u16;
        }
    }
    0
}
