//! Host identity key handling.
//!
//! The secret key signs every outbound datagram; the derived public key is
//! the host's `NodeId`. Secrets are zeroized on drop and never printed.

use std::fmt;

use zeroize::Zeroize;

use crate::crypto::{public_for_secret, CryptoError};
use crate::node_id::NodeId;

/// A secp256k1 secret key.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; 32]);

impl SecretKey {
    /// Creates a secret key from raw bytes.
    ///
    /// Validity as a curve scalar is checked when the key is first used.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parses from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s.trim())?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Returns the full hex representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Returns the inner bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// A host identity: secret key plus the node id derived from it.
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: NodeId,
}

impl KeyPair {
    /// Generates a fresh random identity.
    pub fn generate() -> Self {
        use rand::RngCore;
        loop {
            let mut bytes = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut bytes);
            let secret = SecretKey::from_bytes(bytes);
            if let Ok(pair) = Self::from_secret(secret) {
                return pair;
            }
        }
    }

    /// Builds an identity from an existing secret key.
    pub fn from_secret(secret: SecretKey) -> Result<Self, CryptoError> {
        let public = public_for_secret(&secret)?;
        Ok(Self { secret, public })
    }

    /// The signing key.
    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    /// The node id.
    pub fn public(&self) -> NodeId {
        self.public
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair").field("public", &self.public).finish()
    }
}
