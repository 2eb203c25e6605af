//! Ember Proto - Wire format for the ember discovery protocol.
//!
//! Defines the four discovery packet shapes (PING, PONG, FIND_NODE,
//! NEIGHBOURS), their RLP bodies, and the signed datagram frame:
//! `hash(32) ‖ signature(65) ‖ type(1) ‖ rlp_body`.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod wire;

pub use wire::{
    assemble, interpret, max_neighbours_per_packet, Datagram, EncodedPacket, FindNode, Neighbour,
    Neighbours, Payload, Ping, Pong, WireError, MIN_PACKET_SIZE, PACKET_EXPIRATION,
};
