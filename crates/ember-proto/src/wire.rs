//! Datagram assembly and interpretation.
//!
//! Every datagram is self-authenticating: the recoverable signature covers
//! `type ‖ body`, and the leading hash covers `signature ‖ type ‖ body`.
//! The hash of a PING datagram doubles as the correlation token (`echo`)
//! copied into the answering PONG.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use ember_core::crypto::{
    keccak256, recover_public, sign_recoverable, CryptoError, Hash256, SIGNATURE_LENGTH,
};
use ember_core::endpoint::{decode_address, NodeEndpoint};
use ember_core::{NodeId, SecretKey, Timestamp};
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use thiserror::Error;

/// Smallest well-formed datagram: hash, signature, type byte, and the
/// 3-byte RLP body of an empty NEIGHBOURS packet.
pub const MIN_PACKET_SIZE: usize = 32 + SIGNATURE_LENGTH + 1 + 3;

/// Lifetime of an outbound datagram.
pub const PACKET_EXPIRATION: Duration = Duration::from_secs(60);

const PACKET_PING: u8 = 0x01;
const PACKET_PONG: u8 = 0x02;
const PACKET_FIND_NODE: u8 = 0x03;
const PACKET_NEIGHBOURS: u8 = 0x04;

/// Reasons an incoming datagram is rejected.
#[derive(Debug, Error)]
pub enum WireError {
    /// Shorter than the minimum frame.
    #[error("packet too small")]
    PacketTooSmall,

    /// Leading hash does not match the packet contents.
    #[error("bad packet hash")]
    BadHash,

    /// No public key could be recovered from the signature.
    #[error("bad packet signature")]
    BadSignature,

    /// Unrecognized packet type byte.
    #[error("unknown packet type {0}")]
    UnknownType(u8),

    /// RLP body did not match the packet shape.
    #[error("bad packet body: {0}")]
    BadBody(#[from] DecoderError),

    /// Expiration timestamp is in the past.
    #[error("expired packet")]
    Expired,
}

/// Liveness probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    /// Discovery protocol version.
    pub version: u32,
    /// Sender's advertised endpoint.
    pub source: NodeEndpoint,
    /// Recipient's endpoint as seen by the sender.
    pub destination: NodeEndpoint,
    /// Deadline after which the packet is invalid.
    pub expiration: Timestamp,
}

/// Acknowledgement of a PING.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    /// The pinger's endpoint as observed by the responder.
    pub destination: NodeEndpoint,
    /// Hash of the PING datagram being acknowledged.
    pub echo: Hash256,
    /// Deadline after which the packet is invalid.
    pub expiration: Timestamp,
}

/// Request for peers near a target id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNode {
    /// The id being searched for.
    pub target: NodeId,
    /// Deadline after which the packet is invalid.
    pub expiration: Timestamp,
}

/// One peer carried in a NEIGHBOURS response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbour {
    /// Where the peer can be reached.
    pub endpoint: NodeEndpoint,
    /// The peer's id.
    pub id: NodeId,
}

/// Response to FIND_NODE carrying peers near the requested target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbours {
    /// Peers close to the requested target.
    pub nodes: Vec<Neighbour>,
    /// Deadline after which the packet is invalid.
    pub expiration: Timestamp,
}

/// The discovery packet sum type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Liveness probe.
    Ping(Ping),
    /// PING acknowledgement.
    Pong(Pong),
    /// Nearest-peer query.
    FindNode(FindNode),
    /// Nearest-peer response.
    Neighbours(Neighbours),
}

impl Payload {
    /// The wire type byte.
    pub fn packet_type(&self) -> u8 {
        match self {
            Payload::Ping(_) => PACKET_PING,
            Payload::Pong(_) => PACKET_PONG,
            Payload::FindNode(_) => PACKET_FIND_NODE,
            Payload::Neighbours(_) => PACKET_NEIGHBOURS,
        }
    }

    /// Human-readable packet name for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Payload::Ping(_) => "Ping",
            Payload::Pong(_) => "Pong",
            Payload::FindNode(_) => "FindNode",
            Payload::Neighbours(_) => "Neighbours",
        }
    }

    /// The packet's expiration deadline.
    pub fn expiration(&self) -> Timestamp {
        match self {
            Payload::Ping(p) => p.expiration,
            Payload::Pong(p) => p.expiration,
            Payload::FindNode(p) => p.expiration,
            Payload::Neighbours(p) => p.expiration,
        }
    }
}

/// A verified incoming datagram.
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Recovered sender id.
    pub source_id: NodeId,
    /// Hash of the whole datagram; the echo token for PONG replies.
    pub echo: Hash256,
    /// UDP source address.
    pub from: SocketAddr,
    /// Decoded packet contents.
    pub payload: Payload,
}

/// A signed outgoing datagram.
#[derive(Debug, Clone)]
pub struct EncodedPacket {
    /// The complete frame ready for the socket.
    pub bytes: Bytes,
    /// Hash of the frame; recorded by PING senders to validate the echo.
    pub hash: Hash256,
}

impl Encodable for Neighbour {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4);
        match self.endpoint.address {
            std::net::IpAddr::V4(v4) => s.append(&v4.octets().to_vec()),
            std::net::IpAddr::V6(v6) => s.append(&v6.octets().to_vec()),
        };
        s.append(&self.endpoint.udp_port);
        s.append(&self.endpoint.tcp_port);
        s.append(&self.id);
    }
}

impl Decodable for Neighbour {
    fn decode(rlp: &Rlp<'_>) -> Result<Self, DecoderError> {
        Ok(Self {
            endpoint: NodeEndpoint {
                address: decode_address(&rlp.at(0)?)?,
                udp_port: rlp.val_at(1)?,
                tcp_port: rlp.val_at(2)?,
            },
            id: rlp.val_at(3)?,
        })
    }
}

fn encode_body(payload: &Payload) -> Vec<u8> {
    let mut s = RlpStream::new();
    match payload {
        Payload::Ping(p) => {
            s.begin_list(4);
            s.append(&p.version);
            s.append(&p.source);
            s.append(&p.destination);
            s.append(&p.expiration.as_secs());
        }
        Payload::Pong(p) => {
            s.begin_list(3);
            s.append(&p.destination);
            s.append(&p.echo.to_vec());
            s.append(&p.expiration.as_secs());
        }
        Payload::FindNode(p) => {
            s.begin_list(2);
            s.append(&p.target);
            s.append(&p.expiration.as_secs());
        }
        Payload::Neighbours(p) => {
            s.begin_list(2);
            s.append_list(&p.nodes);
            s.append(&p.expiration.as_secs());
        }
    }
    s.out().to_vec()
}

fn decode_body(packet_type: u8, body: &[u8]) -> Result<Payload, WireError> {
    let rlp = Rlp::new(body);
    match packet_type {
        PACKET_PING => Ok(Payload::Ping(Ping {
            version: rlp.val_at(0)?,
            source: rlp.val_at(1)?,
            destination: rlp.val_at(2)?,
            expiration: Timestamp::new(rlp.val_at(3)?),
        })),
        PACKET_PONG => {
            let echo_bytes: Vec<u8> = rlp.val_at(1)?;
            if echo_bytes.len() != 32 {
                return Err(DecoderError::Custom("echo must be 32 bytes").into());
            }
            let mut echo = [0u8; 32];
            echo.copy_from_slice(&echo_bytes);
            Ok(Payload::Pong(Pong {
                destination: rlp.val_at(0)?,
                echo,
                expiration: Timestamp::new(rlp.val_at(2)?),
            }))
        }
        PACKET_FIND_NODE => Ok(Payload::FindNode(FindNode {
            target: rlp.val_at(0)?,
            expiration: Timestamp::new(rlp.val_at(1)?),
        })),
        PACKET_NEIGHBOURS => Ok(Payload::Neighbours(Neighbours {
            nodes: rlp.list_at(0)?,
            expiration: Timestamp::new(rlp.val_at(1)?),
        })),
        other => Err(WireError::UnknownType(other)),
    }
}

/// Encodes, signs, and frames a packet.
pub fn assemble(payload: &Payload, secret: &SecretKey) -> Result<EncodedPacket, CryptoError> {
    let body = encode_body(payload);

    let mut signed = Vec::with_capacity(1 + body.len());
    signed.push(payload.packet_type());
    signed.extend_from_slice(&body);

    let signature = sign_recoverable(&keccak256(&signed), secret)?;

    let mut packet = Vec::with_capacity(32 + SIGNATURE_LENGTH + signed.len());
    packet.extend_from_slice(&[0u8; 32]);
    packet.extend_from_slice(&signature);
    packet.extend_from_slice(&signed);

    let hash = keccak256(&packet[32..]);
    packet[..32].copy_from_slice(&hash);

    Ok(EncodedPacket {
        bytes: Bytes::from(packet),
        hash,
    })
}

/// Verifies and decodes an incoming datagram.
///
/// Validation order: length, hash, signature recovery, type byte, body
/// shape, expiration.
pub fn interpret(from: SocketAddr, data: &[u8]) -> Result<Datagram, WireError> {
    if data.len() < MIN_PACKET_SIZE {
        return Err(WireError::PacketTooSmall);
    }

    let hash = keccak256(&data[32..]);
    if hash != data[..32] {
        return Err(WireError::BadHash);
    }

    let mut signature = [0u8; SIGNATURE_LENGTH];
    signature.copy_from_slice(&data[32..32 + SIGNATURE_LENGTH]);
    let signed = &data[32 + SIGNATURE_LENGTH..];
    let source_id =
        recover_public(&keccak256(signed), &signature).map_err(|_| WireError::BadSignature)?;

    let payload = decode_body(signed[0], &signed[1..])?;
    if payload.expiration().is_expired(Timestamp::now()) {
        return Err(WireError::Expired);
    }

    Ok(Datagram {
        source_id,
        echo: hash,
        from,
        payload,
    })
}

/// How many neighbours fit in one datagram of the given size: the frame
/// overhead is 109 bytes and each neighbour occupies up to 90.
pub fn max_neighbours_per_packet(max_datagram_size: usize) -> usize {
    (max_datagram_size.saturating_sub(109) / 90).max(1)
}
