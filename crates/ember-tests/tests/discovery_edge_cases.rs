//! Hostile-input scenarios driven over real sockets.

use std::time::Duration;

use ember_core::{KeyPair, NodeEndpoint, NodeId, Timestamp, PROTOCOL_VERSION};
use ember_dht::NodeRelation;
use ember_proto::wire::{self, Neighbour, Neighbours, Payload, Ping, PACKET_EXPIRATION};
use ember_tests::{wait_until, TestNode};
use tokio::net::UdpSocket;

async fn raw_sender() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

fn ping_to(target: &TestNode, sender_endpoint: NodeEndpoint) -> Payload {
    Payload::Ping(Ping {
        version: PROTOCOL_VERSION,
        source: sender_endpoint,
        destination: target.endpoint(),
        expiration: Timestamp::from_now(PACKET_EXPIRATION),
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn tampered_hash_is_ignored() {
    let a = TestNode::start().await;
    let stranger = KeyPair::generate();
    let socket = raw_sender().await;
    let sender_endpoint = NodeEndpoint::from_udp(socket.local_addr().unwrap());

    let packet = wire::assemble(&ping_to(&a, sender_endpoint), stranger.secret()).unwrap();
    let mut bytes = packet.bytes.to_vec();
    bytes[3] ^= 0x40;
    socket
        .send_to(&bytes, a.endpoint().udp_addr())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(a.table.nodes().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_packet_is_ignored() {
    let a = TestNode::start().await;
    let stranger = KeyPair::generate();
    let socket = raw_sender().await;
    let sender_endpoint = NodeEndpoint::from_udp(socket.local_addr().unwrap());

    let stale = Payload::Ping(Ping {
        version: PROTOCOL_VERSION,
        source: sender_endpoint,
        destination: a.endpoint(),
        expiration: Timestamp::new(Timestamp::now().as_secs() - 1),
    });
    let packet = wire::assemble(&stale, stranger.secret()).unwrap();
    socket
        .send_to(&packet.bytes, a.endpoint().udp_addr())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(a.table.nodes().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn unsolicited_neighbours_adds_nothing_but_notes_sender() {
    let a = TestNode::start().await;
    let z = KeyPair::generate();
    let socket = raw_sender().await;

    // A trusts Z but holds a stale record of where Z lives; the port is
    // outside the ephemeral range so it cannot collide with the sender
    // socket's.
    let stale_endpoint = NodeEndpoint::new("127.0.0.1".parse().unwrap(), 30399, 30399);
    a.table.add_node(
        ember_dht::Node::new(z.public(), stale_endpoint),
        NodeRelation::Known,
    );

    let smuggled = NodeId::random();
    let payload = Payload::Neighbours(Neighbours {
        nodes: vec![Neighbour {
            endpoint: NodeEndpoint::new("10.9.9.9".parse().unwrap(), 30303, 30303),
            id: smuggled,
        }],
        expiration: Timestamp::from_now(PACKET_EXPIRATION),
    });
    let packet = wire::assemble(&payload, z.secret()).unwrap();
    socket
        .send_to(&packet.bytes, a.endpoint().udp_addr())
        .await
        .unwrap();

    // The carried peer is rejected, but the sender's liveness is still
    // noted: Z's recorded endpoint moves to the address the packet
    // actually came from.
    let sender_port = socket.local_addr().unwrap().port();
    let noted = wait_until(Duration::from_secs(2), || async {
        a.table.entry(&z.public()).map(|e| e.node.endpoint.udp_port) == Some(sender_port)
    })
    .await;
    assert!(noted, "sender liveness was not noted");
    assert!(!a.table.nodes().contains(&smuggled));
}

#[tokio::test(flavor = "multi_thread")]
async fn self_signed_ping_is_ignored() {
    let a = TestNode::start().await;
    let socket = raw_sender().await;
    let sender_endpoint = NodeEndpoint::from_udp(socket.local_addr().unwrap());

    // Recovered sender id equals the host's own id.
    let packet = wire::assemble(&ping_to(&a, sender_endpoint), a.key_pair.secret()).unwrap();
    socket
        .send_to(&packet.bytes, a.endpoint().udp_addr())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(a.table.nodes().is_empty());
    assert!(a.table.snapshot().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn find_node_answered_with_nearest_peers() {
    let a = TestNode::start().await;
    let b = TestNode::start().await;

    // Give A a peer to hand out, then query it from B.
    let c = TestNode::start().await;
    a.table.add_node(c.as_node(), NodeRelation::Known);
    b.table.add_node(a.as_node(), NodeRelation::Unknown);

    let settled = wait_until(Duration::from_secs(3), || async {
        matches!(b.table.entry(&a.node_id()), Some(e) if !e.pending)
    })
    .await;
    assert!(settled);

    b.table.discover(c.node_id());
    let learned = wait_until(Duration::from_secs(5), || async {
        b.table.nodes().contains(&c.node_id())
    })
    .await;
    assert!(learned, "FIND_NODE did not surface A's peer");
}
