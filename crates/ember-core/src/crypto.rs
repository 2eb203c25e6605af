//! Hashing and recoverable signatures.
//!
//! Thin ambient wrappers over the keccak-256 and secp256k1 primitives so
//! that callers (including static parse paths with no live instance) never
//! touch the underlying crates directly.

use std::sync::LazyLock;

use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{All, Message, PublicKey, Secp256k1};
use sha3::{Digest, Keccak256};
use thiserror::Error;

use crate::keys::SecretKey;
use crate::node_id::NodeId;

/// A keccak-256 digest.
pub type Hash256 = [u8; 32];

/// Length of a serialized recoverable signature (r ‖ s ‖ v).
pub const SIGNATURE_LENGTH: usize = 65;

static SECP: LazyLock<Secp256k1<All>> = LazyLock::new(Secp256k1::new);

/// Errors from signing and recovery.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The secret key is not a valid scalar.
    #[error("invalid secret key")]
    InvalidSecretKey,

    /// The signature bytes are malformed.
    #[error("invalid signature encoding")]
    InvalidSignature,

    /// No public key could be recovered from the signature.
    #[error("public key recovery failed")]
    RecoveryFailed,
}

/// Computes keccak-256 of `data`.
pub fn keccak256(data: &[u8]) -> Hash256 {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Signs a 32-byte digest, producing a 65-byte recoverable signature
/// (r ‖ s ‖ recovery id).
pub fn sign_recoverable(
    digest: &Hash256,
    secret: &SecretKey,
) -> Result<[u8; SIGNATURE_LENGTH], CryptoError> {
    let sk = secp256k1::SecretKey::from_slice(secret.as_bytes())
        .map_err(|_| CryptoError::InvalidSecretKey)?;
    let message = Message::from_digest(*digest);
    let signature = SECP.sign_ecdsa_recoverable(&message, &sk);
    let (recovery_id, data) = signature.serialize_compact();
    let mut out = [0u8; SIGNATURE_LENGTH];
    out[..64].copy_from_slice(&data);
    out[64] = recovery_id.to_i32() as u8;
    Ok(out)
}

/// Recovers the signer's node id from a 65-byte recoverable signature over
/// `digest`.
pub fn recover_public(
    digest: &Hash256,
    signature: &[u8; SIGNATURE_LENGTH],
) -> Result<NodeId, CryptoError> {
    let recovery_id =
        RecoveryId::from_i32(signature[64] as i32).map_err(|_| CryptoError::InvalidSignature)?;
    let recoverable = RecoverableSignature::from_compact(&signature[..64], recovery_id)
        .map_err(|_| CryptoError::InvalidSignature)?;
    let message = Message::from_digest(*digest);
    let public = SECP
        .recover_ecdsa(&message, &recoverable)
        .map_err(|_| CryptoError::RecoveryFailed)?;
    Ok(node_id_from_public(&public))
}

/// Derives the node id for a secret key.
pub fn public_for_secret(secret: &SecretKey) -> Result<NodeId, CryptoError> {
    let sk = secp256k1::SecretKey::from_slice(secret.as_bytes())
        .map_err(|_| CryptoError::InvalidSecretKey)?;
    Ok(node_id_from_public(&PublicKey::from_secret_key(&SECP, &sk)))
}

fn node_id_from_public(public: &PublicKey) -> NodeId {
    // Uncompressed serialization is 0x04 followed by the 64-byte point.
    let serialized = public.serialize_uncompressed();
    let mut id = [0u8; 64];
    id.copy_from_slice(&serialized[1..]);
    NodeId::new(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;

    #[test]
    fn test_sign_recover_roundtrip() {
        let pair = KeyPair::generate();
        let digest = keccak256(b"ember discovery");

        let signature = sign_recoverable(&digest, pair.secret()).unwrap();
        let recovered = recover_public(&digest, &signature).unwrap();
        assert_eq!(recovered, pair.public());
    }

    #[test]
    fn test_recover_wrong_digest_yields_other_id() {
        let pair = KeyPair::generate();
        let signature = sign_recoverable(&keccak256(b"one"), pair.secret()).unwrap();

        match recover_public(&keccak256(b"two"), &signature) {
            Ok(id) => assert_ne!(id, pair.public()),
            Err(e) => assert_eq!(e, CryptoError::RecoveryFailed),
        }
    }

    #[test]
    fn test_keccak_known_vector() {
        // keccak256("") is a fixed constant.
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_invalid_recovery_id() {
        let mut signature = [0u8; SIGNATURE_LENGTH];
        signature[64] = 7;
        assert_eq!(
            recover_public(&keccak256(b"x"), &signature),
            Err(CryptoError::InvalidSignature)
        );
    }
}
