//! Node endpoints and the address admission policy.
//!
//! Only *allowed* endpoints may enter the routing table: the address must
//! not be loopback, multicast, unspecified, or reserved, and the UDP port
//! must be non-zero. A process-wide override admits loopback and other
//! local addresses for tests and single-host deployments.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};

use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use serde::{Deserialize, Serialize};

static ALLOW_LOCAL_PEERS: AtomicBool = AtomicBool::new(false);

/// Admits loopback and link-local peer addresses process-wide.
pub fn set_allow_local_peers(allow: bool) {
    ALLOW_LOCAL_PEERS.store(allow, Ordering::Relaxed);
}

/// Returns whether local peer addresses are currently admitted.
pub fn allow_local_peers() -> bool {
    ALLOW_LOCAL_PEERS.load(Ordering::Relaxed)
}

/// A peer's network location: address plus UDP and TCP ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeEndpoint {
    /// IP address.
    pub address: IpAddr,
    /// Discovery (UDP) port.
    pub udp_port: u16,
    /// Session (TCP) port advertised alongside discovery.
    pub tcp_port: u16,
}

impl NodeEndpoint {
    /// Creates an endpoint.
    pub fn new(address: IpAddr, udp_port: u16, tcp_port: u16) -> Self {
        Self {
            address,
            udp_port,
            tcp_port,
        }
    }

    /// Creates an endpoint from a UDP socket address, mirroring the port
    /// for TCP.
    pub fn from_udp(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port(), addr.port())
    }

    /// The UDP socket address.
    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.udp_port)
    }

    /// The TCP socket address.
    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.tcp_port)
    }

    /// Returns true if the endpoint carries no usable location.
    pub fn is_unspecified(&self) -> bool {
        self.address.is_unspecified() || self.udp_port == 0
    }

    /// Returns true if the endpoint may enter the routing table.
    pub fn is_allowed(&self) -> bool {
        self.udp_port != 0 && is_allowed_address(&self.address)
    }
}

impl Default for NodeEndpoint {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, 0)
    }
}

impl fmt::Display for NodeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.udp_port)
    }
}

impl Encodable for NodeEndpoint {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        match self.address {
            IpAddr::V4(v4) => s.append(&v4.octets().to_vec()),
            IpAddr::V6(v6) => s.append(&v6.octets().to_vec()),
        };
        s.append(&self.udp_port);
        s.append(&self.tcp_port);
    }
}

impl Decodable for NodeEndpoint {
    fn decode(rlp: &Rlp<'_>) -> Result<Self, DecoderError> {
        let address = decode_address(&rlp.at(0)?)?;
        Ok(Self {
            address,
            udp_port: rlp.val_at(1)?,
            tcp_port: rlp.val_at(2)?,
        })
    }
}

/// Decodes a 4-or-16-byte RLP address item into an `IpAddr`.
pub fn decode_address(rlp: &Rlp<'_>) -> Result<IpAddr, DecoderError> {
    let bytes: Vec<u8> = rlp.as_val()?;
    match bytes.len() {
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&bytes);
            Ok(IpAddr::from(octets))
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes);
            Ok(IpAddr::from(octets))
        }
        _ => Err(DecoderError::Custom("ip address must be 4 or 16 bytes")),
    }
}

fn is_allowed_address(ip: &IpAddr) -> bool {
    if ip.is_unspecified() || ip.is_multicast() {
        return false;
    }
    if ip.is_loopback() {
        return allow_local_peers();
    }
    match ip {
        IpAddr::V4(v4) => {
            let first = v4.octets()[0];
            // 0.0.0.0/8 and 240.0.0.0/4 are reserved; 255.255.255.255 is broadcast.
            !v4.is_broadcast() && first != 0 && first < 240
        }
        IpAddr::V6(_) => true,
    }
}

/// Returns true if the address is globally routable, i.e. usable as the
/// host's advertised endpoint.
pub fn is_public_address(ip: &IpAddr) -> bool {
    if !is_allowed_address(ip) || ip.is_loopback() {
        return false;
    }
    match ip {
        IpAddr::V4(v4) => !v4.is_private() && !v4.is_link_local(),
        IpAddr::V6(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(addr: &str, udp: u16) -> NodeEndpoint {
        NodeEndpoint::new(addr.parse().unwrap(), udp, udp)
    }

    #[test]
    fn test_admission_policy() {
        assert!(ep("8.8.8.8", 30303).is_allowed());
        assert!(ep("10.0.0.1", 30303).is_allowed());
        assert!(ep("192.168.1.5", 30303).is_allowed());

        assert!(!ep("0.0.0.0", 30303).is_allowed());
        assert!(!ep("224.0.0.1", 30303).is_allowed());
        assert!(!ep("255.255.255.255", 30303).is_allowed());
        assert!(!ep("240.1.1.1", 30303).is_allowed());
        assert!(!ep("8.8.8.8", 0).is_allowed());

        // Loopback flips with the process-wide override.
        assert!(!ep("127.0.0.1", 30303).is_allowed());
        set_allow_local_peers(true);
        assert!(ep("127.0.0.1", 30303).is_allowed());
        set_allow_local_peers(false);
    }

    #[test]
    fn test_public_address() {
        assert!(is_public_address(&"8.8.8.8".parse().unwrap()));
        assert!(!is_public_address(&"10.0.0.1".parse().unwrap()));
        assert!(!is_public_address(&"192.168.1.5".parse().unwrap()));
        assert!(!is_public_address(&"127.0.0.1".parse().unwrap()));
        assert!(!is_public_address(&"169.254.0.1".parse().unwrap()));
    }

    #[test]
    fn test_rlp_roundtrip_v4() {
        let endpoint = ep("10.1.2.3", 30303);
        let encoded = rlp::encode(&endpoint);
        let decoded: NodeEndpoint = rlp::decode(&encoded).unwrap();
        assert_eq!(endpoint, decoded);
    }

    #[test]
    fn test_rlp_roundtrip_v6() {
        let endpoint = NodeEndpoint::new("2001:db8::1".parse().unwrap(), 30303, 30304);
        let encoded = rlp::encode(&endpoint);
        let decoded: NodeEndpoint = rlp::decode(&encoded).unwrap();
        assert_eq!(endpoint, decoded);
    }

    #[test]
    fn test_unspecified() {
        assert!(NodeEndpoint::default().is_unspecified());
        assert!(ep("8.8.8.8", 0).is_unspecified());
        assert!(!ep("8.8.8.8", 30303).is_unspecified());
    }
}
