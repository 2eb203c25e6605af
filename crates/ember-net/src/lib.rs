//! Ember Net - UDP transport for the ember discovery network.
//!
//! Discovery runs over plain UDP: datagrams are authenticated by the
//! protocol layer, not encrypted. The transport owns the socket, runs the
//! receive loop, and offers non-blocking best-effort sends.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod udp;

pub use udp::{DatagramHandler, TransportError, UdpTransport, MAX_DATAGRAM_SIZE};
