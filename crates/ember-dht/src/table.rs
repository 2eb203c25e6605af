//! The node table: registry, buckets, protocol handler, and discovery.
//!
//! All shared state lives behind short-lived parking_lot mutexes. Lock
//! order, low to high: buckets (`state`), registry (`nodes`), eviction
//! tracker (`evictions`), pending FIND_NODE queue (`find_node_requests`),
//! ping expectations (`ping_expectations`). A higher lock may be taken
//! while a lower one is held, never the reverse; most paths stage through
//! owned snapshots and hold one lock at a time.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use ember_core::crypto::Hash256;
use ember_core::{
    is_public_address, log_distance, NodeEndpoint, NodeId, KeyPair, Timestamp, PROTOCOL_VERSION,
};
use ember_net::{DatagramHandler, UdpTransport};
use ember_proto::wire::{
    self, Datagram, FindNode, Neighbour, Neighbours, Payload, Ping, Pong, PACKET_EXPIRATION,
};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::eviction::EvictionTracker;
use crate::events::{EventEmitter, NodeEventHandler, NodeEventKind};
use crate::node::{Node, NodeEntry, NodeRelation};
use crate::routing::NodeBucket;
use crate::timers::Scheduler;
use crate::{
    BUCKET_COUNT, BUCKET_SIZE, BUCKET_REFRESH_INTERVAL, DISCOVERY_MAX_ROUNDS,
    DISCOVERY_PARALLELISM, EVICTION_CHECK_INTERVAL, REQUEST_TIMEOUT,
};

/// Node table configuration.
#[derive(Debug, Clone)]
pub struct NodeTableConfig {
    /// Endpoint to bind and advertise for discovery.
    pub endpoint: NodeEndpoint,
    /// When false the table is dormant: no socket, no discovery.
    pub enabled: bool,
}

impl NodeTableConfig {
    /// Creates an enabled configuration for the given endpoint.
    pub fn new(endpoint: NodeEndpoint) -> Self {
        Self {
            endpoint,
            enabled: true,
        }
    }
}

/// Registry of every node the table has heard of, plus the host's own
/// mutable record. Exclusive owner of `NodeEntry` values.
struct Registry {
    host: Node,
    entries: HashMap<NodeId, NodeEntry>,
}

/// Hash and send time of the most recent PING to a peer, kept to validate
/// the echo field of its PONG.
struct PingExpectation {
    echo: Hash256,
    sent_at: Instant,
}

/// Kademlia-style node table and discovery engine.
pub struct NodeTable {
    key_pair: KeyPair,
    local_id: NodeId,
    enabled: bool,
    transport: Arc<UdpTransport>,
    scheduler: Scheduler,
    state: Mutex<Vec<NodeBucket>>,
    nodes: Mutex<Registry>,
    evictions: Mutex<EvictionTracker>,
    find_node_requests: Mutex<VecDeque<(NodeId, Instant)>>,
    ping_expectations: Mutex<HashMap<NodeId, PingExpectation>>,
    events: EventEmitter,
    weak_self: Weak<NodeTable>,
}

impl NodeTable {
    /// Creates a table for the given identity. Dormant until [`start`] is
    /// called.
    ///
    /// [`start`]: NodeTable::start
    pub fn new(key_pair: KeyPair, config: NodeTableConfig) -> Arc<Self> {
        let local_id = key_pair.public();
        let host = Node::new(local_id, config.endpoint);
        let transport = Arc::new(UdpTransport::new(config.endpoint.udp_addr()));

        Arc::new_cyclic(|weak| Self {
            key_pair,
            local_id,
            enabled: config.enabled,
            transport,
            scheduler: Scheduler::new(),
            state: Mutex::new((0..BUCKET_COUNT).map(|_| NodeBucket::new()).collect()),
            nodes: Mutex::new(Registry {
                host,
                entries: HashMap::new(),
            }),
            evictions: Mutex::new(EvictionTracker::new()),
            find_node_requests: Mutex::new(VecDeque::new()),
            ping_expectations: Mutex::new(HashMap::new()),
            events: EventEmitter::new(),
            weak_self: weak.clone(),
        })
    }

    /// Binds the discovery socket and schedules the first refresh.
    ///
    /// A bind failure is logged and leaves the table dormant; everything
    /// else keeps working against an empty, never-refreshed table.
    pub async fn start(&self) {
        if !self.enabled {
            info!("discovery disabled, node table is dormant");
            return;
        }
        let handler: Weak<dyn DatagramHandler> = self.weak_self.clone();
        if let Err(e) = self.transport.connect(handler).await {
            warn!(error = %e, "discovery socket unavailable, node table is dormant");
            return;
        }
        if let Some(local) = self.transport.local_addr() {
            // When bound to an ephemeral port, advertise the real one.
            let mut registry = self.nodes.lock();
            if registry.host.endpoint.udp_port == 0 {
                registry.host.endpoint.udp_port = local.port();
                registry.host.endpoint.tcp_port = local.port();
            }
        }
        self.schedule_refresh();
    }

    /// Stops the socket and cancels every pending timer.
    pub fn shutdown(&self) {
        self.transport.disconnect();
        self.scheduler.stop();
    }

    /// The host's node id.
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// The host's currently advertised endpoint.
    pub fn host_endpoint(&self) -> NodeEndpoint {
        self.nodes.lock().host.endpoint
    }

    /// Returns true while the discovery socket is bound.
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Registers the membership event subscriber.
    pub fn set_event_handler(&self, handler: Box<dyn NodeEventHandler>) {
        self.events.set_handler(handler);
    }

    /// Drains queued membership events to the subscriber.
    pub fn process_events(&self) {
        self.events.process_events();
    }

    /// Ids of every node in the registry, bucketed or pending.
    pub fn nodes(&self) -> Vec<NodeId> {
        self.nodes.lock().entries.keys().copied().collect()
    }

    /// Every live entry reachable from a bucket.
    pub fn snapshot(&self) -> Vec<NodeEntry> {
        let ids: Vec<NodeId> = {
            let state = self.state.lock();
            state.iter().flat_map(|b| b.iter().copied()).collect()
        };
        let registry = self.nodes.lock();
        ids.iter()
            .filter_map(|id| registry.entries.get(id).cloned())
            .collect()
    }

    /// Looks up a node's public record.
    pub fn node(&self, id: &NodeId) -> Option<Node> {
        self.nodes.lock().entries.get(id).map(|e| e.node.clone())
    }

    /// Looks up the full registry entry, including placement state.
    pub fn entry(&self, id: &NodeId) -> Option<NodeEntry> {
        self.nodes.lock().entries.get(id).cloned()
    }

    /// Number of FIND_NODE requests still awaiting a NEIGHBOURS answer.
    pub fn pending_request_count(&self) -> usize {
        self.find_node_requests.lock().len()
    }

    /// Introduces a node to the table.
    ///
    /// `Known` nodes are trusted: the entry overwrites any previous record
    /// and goes straight toward a bucket. `Unknown` nodes are parked as
    /// pending and must answer a PING first.
    pub fn add_node(&self, node: Node, relation: NodeRelation) {
        if node.id == self.local_id {
            return;
        }
        match relation {
            NodeRelation::Known => {
                let entry = NodeEntry::new(&self.local_id, node.clone(), false);
                self.nodes.lock().entries.insert(node.id, entry);
                self.note_active_node(node.id, node.endpoint.udp_addr());
            }
            NodeRelation::Unknown => {
                if node.id.is_zero() || node.endpoint.is_unspecified() {
                    return;
                }
                {
                    let mut registry = self.nodes.lock();
                    if registry.entries.contains_key(&node.id) {
                        return;
                    }
                    let entry = NodeEntry::new(&self.local_id, node.clone(), true);
                    registry.entries.insert(node.id, entry);
                }
                debug!(id = %node.id, endpoint = %node.endpoint, "new pending node");
                self.ping(node.id, node.endpoint);
            }
        }
    }

    /// Removes a node from its bucket and the registry.
    pub fn drop_node(&self, id: &NodeId) {
        let Some(distance) = self.nodes.lock().entries.get(id).map(|e| e.distance) else {
            return;
        };
        let was_bucketed = {
            let mut state = self.state.lock();
            state[usize::from(distance) - 1].remove(id)
        };
        self.nodes.lock().entries.remove(id);
        debug!(%id, "dropped node");
        if was_bucketed {
            self.events.append(*id, NodeEventKind::Dropped);
        }
    }

    /// Starts an iterative lookup toward `target`.
    pub fn discover(&self, target: NodeId) {
        self.discover_round(target, 0, HashSet::new());
    }

    /// Up to 16 live entries closest to `target` by XOR log-distance,
    /// restricted to allowed endpoints.
    pub fn nearest_entries(&self, target: &NodeId) -> Vec<NodeEntry> {
        let ids: Vec<NodeId> = {
            let state = self.state.lock();
            state.iter().flat_map(|b| b.iter().copied()).collect()
        };

        let registry = self.nodes.lock();
        let mut by_distance: BTreeMap<u16, Vec<NodeEntry>> = BTreeMap::new();
        for id in ids {
            if let Some(entry) = registry.entries.get(&id) {
                if entry.node.endpoint.is_allowed() {
                    by_distance
                        .entry(log_distance(target, &id))
                        .or_default()
                        .push(entry.clone());
                }
            }
        }

        let mut nearest = Vec::with_capacity(BUCKET_SIZE);
        for group in by_distance.into_values() {
            for entry in group {
                if nearest.len() == BUCKET_SIZE {
                    return nearest;
                }
                nearest.push(entry);
            }
        }
        nearest
    }

    /// Records a confirmed-live peer at an observed address and positions
    /// it in its bucket.
    ///
    /// Unknown and still-pending peers are skipped; the PING/PONG flow
    /// brings them back here once validated.
    fn note_active_node(&self, id: NodeId, from: SocketAddr) {
        if id == self.local_id {
            return;
        }
        let observed = NodeEndpoint::from_udp(from);
        if !observed.is_allowed() {
            return;
        }

        let distance = {
            let mut registry = self.nodes.lock();
            let Some(entry) = registry.entries.get_mut(&id) else {
                return;
            };
            if entry.pending {
                return;
            }
            entry.node.endpoint.address = from.ip();
            entry.node.endpoint.udp_port = from.port();
            entry.distance
        };
        trace!(%id, %from, "noting active node");

        let mut challenge: Option<NodeId> = None;
        {
            let mut state = self.state.lock();
            let bucket = &mut state[usize::from(distance) - 1];
            if bucket.touch(&id) {
                // Refreshed an existing resident.
            } else if bucket.len() < BUCKET_SIZE {
                bucket.push(id);
                self.events.append(id, NodeEventKind::Added);
            } else if let Some(&head) = bucket.head() {
                // The head slot may be stale: its id can have left the
                // registry since it was bucketed.
                let head_live = self.nodes.lock().entries.contains_key(&head);
                if head_live {
                    challenge = Some(head);
                } else {
                    bucket.pop_head();
                    bucket.push(id);
                    self.events.append(id, NodeEventKind::Added);
                }
            }
        }

        if let Some(head) = challenge {
            self.begin_eviction(head, id);
        }
    }

    /// Challenges a bucket incumbent on behalf of a fresh candidate.
    fn begin_eviction(&self, challenged: NodeId, replacement: NodeId) {
        if !self.transport.is_open() {
            return;
        }
        let Some(endpoint) = self
            .nodes
            .lock()
            .entries
            .get(&challenged)
            .map(|e| e.node.endpoint)
        else {
            return;
        };

        let first = self
            .evictions
            .lock()
            .challenge(challenged, replacement, Instant::now());
        debug!(%challenged, %replacement, "starting eviction challenge");
        if first {
            self.schedule_eviction_sweep();
        }
        self.ping(challenged, endpoint);
    }

    fn schedule_eviction_sweep(&self) {
        let weak = self.weak_self.clone();
        self.scheduler.schedule(EVICTION_CHECK_INTERVAL, move || {
            if let Some(table) = weak.upgrade() {
                table.sweep_evictions();
            }
        });
    }

    /// Resolves challenges whose incumbent stayed silent past the window:
    /// the incumbent is dropped and the replacement takes the freed slot.
    fn sweep_evictions(&self) {
        let timed_out = self
            .evictions
            .lock()
            .take_timed_out(Instant::now(), REQUEST_TIMEOUT);

        for (challenged, replacement) in timed_out {
            let (challenged_present, replacement_endpoint) = {
                let registry = self.nodes.lock();
                (
                    registry.entries.contains_key(&challenged),
                    registry
                        .entries
                        .get(&replacement)
                        .map(|e| e.node.endpoint),
                )
            };
            if !challenged_present {
                continue;
            }
            debug!(%challenged, %replacement, "eviction challenge timed out");
            self.drop_node(&challenged);
            if let Some(endpoint) = replacement_endpoint {
                self.note_active_node(replacement, endpoint.udp_addr());
            }
        }

        if !self.evictions.lock().is_empty() {
            self.schedule_eviction_sweep();
        }
    }

    /// One round of an iterative lookup: query the `alpha` closest
    /// not-yet-tried peers, then schedule the next round.
    fn discover_round(&self, target: NodeId, round: usize, mut tried: HashSet<NodeId>) {
        if !self.transport.is_open() {
            return;
        }
        {
            // Requests from earlier rounds that were never answered are
            // dead; drop their rows.
            let now = Instant::now();
            self.find_node_requests
                .lock()
                .retain(|(_, sent_at)| now.duration_since(*sent_at) < REQUEST_TIMEOUT);
        }
        if round == DISCOVERY_MAX_ROUNDS {
            debug!(round, "lookup finished");
            self.schedule_refresh();
            return;
        }

        let mut batch = Vec::with_capacity(DISCOVERY_PARALLELISM);
        for entry in self.nearest_entries(&target) {
            if batch.len() == DISCOVERY_PARALLELISM {
                break;
            }
            if !tried.contains(&entry.node.id) {
                batch.push((entry.node.id, entry.node.endpoint));
            }
        }
        if batch.is_empty() {
            debug!(round, "lookup exhausted known peers");
            self.schedule_refresh();
            return;
        }

        for (id, endpoint) in batch {
            self.find_node_requests
                .lock()
                .push_back((id, Instant::now()));
            let payload = Payload::FindNode(FindNode {
                target,
                expiration: Timestamp::from_now(PACKET_EXPIRATION),
            });
            trace!(to = %id, %target, "sending FindNode");
            self.send_packet(&payload, endpoint.udp_addr());
            tried.insert(id);
        }

        let weak = self.weak_self.clone();
        self.scheduler.schedule(REQUEST_TIMEOUT * 2, move || {
            if let Some(table) = weak.upgrade() {
                table.discover_round(target, round + 1, tried);
            }
        });
    }

    /// Schedules the next table-stirring lookup toward a random target.
    fn schedule_refresh(&self) {
        let weak = self.weak_self.clone();
        self.scheduler.schedule(BUCKET_REFRESH_INTERVAL, move || {
            let Some(table) = weak.upgrade() else {
                return;
            };
            debug!("starting random discovery");
            table.discover(NodeId::random());
        });
    }

    /// Sends a PING and records its hash as the expected PONG echo.
    fn ping(&self, to: NodeId, endpoint: NodeEndpoint) {
        let source = self.nodes.lock().host.endpoint;
        let payload = Payload::Ping(Ping {
            version: PROTOCOL_VERSION,
            source,
            destination: endpoint,
            expiration: Timestamp::from_now(PACKET_EXPIRATION),
        });
        trace!(%to, %endpoint, "sending Ping");
        if let Some(hash) = self.send_packet(&payload, endpoint.udp_addr()) {
            let now = Instant::now();
            let mut expectations = self.ping_expectations.lock();
            expectations
                .retain(|_, exp| now.duration_since(exp.sent_at) < PACKET_EXPIRATION);
            expectations.insert(
                to,
                PingExpectation {
                    echo: hash,
                    sent_at: now,
                },
            );
        }
    }

    /// Signs and transmits a packet; returns its hash on success.
    fn send_packet(&self, payload: &Payload, to: SocketAddr) -> Option<Hash256> {
        let packet = match wire::assemble(payload, self.key_pair.secret()) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "failed to sign outgoing packet");
                return None;
            }
        };
        if packet.bytes.len() > self.transport.max_datagram_size() {
            warn!(
                size = packet.bytes.len(),
                kind = payload.type_name(),
                "sending oversized datagram"
            );
        }
        self.transport.send(to, packet.bytes);
        Some(packet.hash)
    }

    fn handle_datagram(&self, datagram: Datagram) {
        let Datagram {
            source_id,
            echo,
            from,
            payload,
        } = datagram;
        trace!(kind = payload.type_name(), %source_id, %from, "received packet");

        match payload {
            Payload::Ping(ping) => self.handle_ping(source_id, from, echo, &ping),
            Payload::Pong(pong) => {
                if !self.handle_pong(source_id, &pong) {
                    return;
                }
            }
            Payload::FindNode(request) => self.handle_find_node(from, &request),
            Payload::Neighbours(neighbours) => self.handle_neighbours(source_id, from, neighbours),
        }

        self.note_active_node(source_id, from);
    }

    /// Learns the pinger (pending until it answers our own PING) and
    /// acknowledges with a PONG echoing the datagram hash.
    fn handle_ping(&self, source_id: NodeId, from: SocketAddr, echo: Hash256, ping: &Ping) {
        // Trust the socket address over the claimed endpoint, keeping only
        // the advertised TCP port.
        let observed = NodeEndpoint::new(from.ip(), from.port(), ping.source.tcp_port);
        self.add_node(Node::new(source_id, observed), NodeRelation::Unknown);

        let payload = Payload::Pong(Pong {
            destination: observed,
            echo,
            expiration: Timestamp::from_now(PACKET_EXPIRATION),
        });
        trace!(to = %source_id, "sending Pong");
        self.send_packet(&payload, from);
    }

    /// Validates a PONG against the expected echo, settles any eviction
    /// challenge on the sender, clears its pending flag, and learns our
    /// externally visible endpoint.
    ///
    /// Returns false when the PONG is rejected outright.
    fn handle_pong(&self, source_id: NodeId, pong: &Pong) -> bool {
        {
            let mut expectations = self.ping_expectations.lock();
            match expectations.get(&source_id) {
                Some(expected) if expected.echo == pong.echo => {
                    expectations.remove(&source_id);
                }
                Some(_) => {
                    warn!(%source_id, "pong echo mismatch, dropping");
                    return false;
                }
                None => {
                    warn!(%source_id, "unsolicited pong, dropping");
                    return false;
                }
            }
        }

        let survived_replacement = self
            .evictions
            .lock()
            .resolve(&source_id, Instant::now(), REQUEST_TIMEOUT);
        if let Some(replacement) = survived_replacement {
            debug!(incumbent = %source_id, %replacement, "incumbent answered eviction challenge");
            self.drop_node(&replacement);
        }

        {
            let mut registry = self.nodes.lock();
            if let Some(entry) = registry.entries.get_mut(&source_id) {
                entry.pending = false;
            }

            // Learn our externally visible endpoint from the responder's
            // view of us.
            if !registry.host.endpoint.is_allowed()
                && is_public_address(&pong.destination.address)
            {
                registry.host.endpoint.address = pong.destination.address;
            }
            registry.host.endpoint.udp_port = pong.destination.udp_port;
        }
        true
    }

    /// Answers with the nearest known peers, split across datagrams.
    fn handle_find_node(&self, from: SocketAddr, request: &FindNode) {
        let nearest = self.nearest_entries(&request.target);
        let limit = wire::max_neighbours_per_packet(self.transport.max_datagram_size());
        for chunk in nearest.chunks(limit) {
            let payload = Payload::Neighbours(Neighbours {
                nodes: chunk
                    .iter()
                    .map(|e| Neighbour {
                        endpoint: e.node.endpoint,
                        id: e.node.id,
                    })
                    .collect(),
                expiration: Timestamp::from_now(PACKET_EXPIRATION),
            });
            trace!(%from, count = chunk.len(), "sending Neighbours");
            self.send_packet(&payload, from);
        }
    }

    /// Admits carried peers only when a FIND_NODE to the sender is still
    /// outstanding; anything else is an injection attempt.
    fn handle_neighbours(&self, source_id: NodeId, from: SocketAddr, neighbours: Neighbours) {
        let now = Instant::now();
        let mut expected = false;
        {
            let mut requests = self.find_node_requests.lock();
            requests.retain(|(id, sent_at)| {
                if *id != source_id {
                    return true;
                }
                if now.duration_since(*sent_at) < REQUEST_TIMEOUT {
                    expected = true;
                    true
                } else {
                    false
                }
            });
        }
        if !expected {
            debug!(%from, "dropping unsolicited neighbours packet");
            return;
        }

        for neighbour in neighbours.nodes {
            self.add_node(
                Node::new(neighbour.id, neighbour.endpoint),
                NodeRelation::Unknown,
            );
        }
    }
}

#[async_trait]
impl DatagramHandler for NodeTable {
    async fn on_datagram(&self, from: SocketAddr, data: bytes::Bytes) {
        match wire::interpret(from, &data) {
            Ok(datagram) => self.handle_datagram(datagram),
            Err(e) => warn!(%from, error = %e, "dropping invalid discovery packet"),
        }
    }
}

impl Drop for NodeTable {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct Recorder {
        seen: Arc<StdMutex<Vec<(NodeId, NodeEventKind)>>>,
    }

    impl NodeEventHandler for Recorder {
        fn on_node_event(&self, id: NodeId, kind: NodeEventKind) {
            self.seen.lock().unwrap().push((id, kind));
        }
    }

    async fn started_table() -> Arc<NodeTable> {
        let config = NodeTableConfig::new(NodeEndpoint::new(
            "127.0.0.1".parse().unwrap(),
            0,
            0,
        ));
        let table = NodeTable::new(KeyPair::generate(), config);
        table.start().await;
        assert!(table.is_open());
        table
    }

    fn peer_endpoint(index: usize) -> NodeEndpoint {
        // Private addresses pass the admission policy without the
        // allow-local override.
        let address = format!("10.{}.{}.{}", index / 65536, (index / 256) % 256, index % 256);
        NodeEndpoint::new(address.parse().unwrap(), 30303, 30303)
    }

    /// Random ids at a fixed log-distance from `host`; distance 256 covers
    /// half the id space, so a handful of draws per id suffices.
    fn ids_at_distance(host: &NodeId, distance: u16, count: usize) -> Vec<NodeId> {
        let mut ids = Vec::with_capacity(count);
        while ids.len() < count {
            let id = NodeId::random();
            if log_distance(host, &id) == distance {
                ids.push(id);
            }
        }
        ids
    }

    #[tokio::test]
    async fn test_add_known_is_bucketed_immediately() {
        let table = started_table().await;
        let id = NodeId::random();
        table.add_node(Node::new(id, peer_endpoint(1)), NodeRelation::Known);

        assert!(table.nodes().contains(&id));
        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].node.id, id);
        assert!(!snapshot[0].pending);
    }

    #[tokio::test]
    async fn test_add_unknown_stays_pending() {
        let table = started_table().await;
        let id = NodeId::random();
        table.add_node(Node::new(id, peer_endpoint(2)), NodeRelation::Unknown);

        assert!(table.nodes().contains(&id));
        assert!(table.entry(&id).unwrap().pending);
        assert!(table.snapshot().is_empty());
        // The liveness probe was recorded for echo validation.
        assert!(table.ping_expectations.lock().contains_key(&id));
    }

    #[tokio::test]
    async fn test_add_unknown_twice_is_noop() {
        let table = started_table().await;
        let id = NodeId::random();
        table.add_node(Node::new(id, peer_endpoint(3)), NodeRelation::Unknown);
        table.add_node(Node::new(id, peer_endpoint(4)), NodeRelation::Unknown);

        assert_eq!(table.entry(&id).unwrap().node.endpoint, peer_endpoint(3));
    }

    #[tokio::test]
    async fn test_self_id_never_stored() {
        let table = started_table().await;
        table.add_node(
            Node::new(table.local_id(), peer_endpoint(5)),
            NodeRelation::Known,
        );
        assert!(table.nodes().is_empty());
        assert!(table.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_disallowed_endpoint_never_bucketed() {
        let table = started_table().await;
        let id = NodeId::random();
        // Multicast fails the admission policy.
        let endpoint = NodeEndpoint::new("224.0.0.1".parse().unwrap(), 30303, 30303);
        table.add_node(Node::new(id, endpoint), NodeRelation::Known);

        assert!(table.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_bucket_placement_matches_distance() {
        let table = started_table().await;
        for i in 0..32 {
            table.add_node(
                Node::new(NodeId::random(), peer_endpoint(i + 10)),
                NodeRelation::Known,
            );
        }

        let state = table.state.lock();
        for (index, bucket) in state.iter().enumerate() {
            assert!(bucket.len() <= BUCKET_SIZE);
            for id in bucket.iter() {
                let entry = table.nodes.lock().entries.get(id).cloned().unwrap();
                assert_eq!(usize::from(entry.distance) - 1, index);
                assert_ne!(*id, table.local_id());
                assert!(entry.node.endpoint.is_allowed());
            }
        }
    }

    #[tokio::test]
    async fn test_note_active_moves_resident_to_tail() {
        let table = started_table().await;
        let ids = ids_at_distance(&table.local_id(), 256, 3);
        for (i, id) in ids.iter().enumerate() {
            table.add_node(Node::new(*id, peer_endpoint(i + 50)), NodeRelation::Known);
        }

        // Reconfirm the oldest resident; it should become most recent.
        table.note_active_node(ids[0], peer_endpoint(50).udp_addr());
        let state = table.state.lock();
        let bucket = &state[255];
        let order: Vec<NodeId> = bucket.iter().copied().collect();
        assert_eq!(order, vec![ids[1], ids[2], ids[0]]);
    }

    #[tokio::test]
    async fn test_full_bucket_starts_challenge() {
        let table = started_table().await;
        let ids = ids_at_distance(&table.local_id(), 256, BUCKET_SIZE + 1);
        for (i, id) in ids.iter().enumerate() {
            table.add_node(Node::new(*id, peer_endpoint(i + 100)), NodeRelation::Known);
        }

        // The newcomer waits while the head is challenged.
        {
            let evictions = table.evictions.lock();
            assert_eq!(evictions.len(), 1);
            assert_eq!(
                evictions.get(&ids[0]).unwrap().replacement,
                ids[BUCKET_SIZE]
            );
        }
        let state = table.state.lock();
        assert_eq!(state[255].len(), BUCKET_SIZE);
        assert!(!state[255].contains(&ids[BUCKET_SIZE]));
    }

    #[tokio::test]
    async fn test_incumbent_survives_challenge() {
        let table = started_table().await;
        let ids = ids_at_distance(&table.local_id(), 256, BUCKET_SIZE + 1);
        for (i, id) in ids.iter().enumerate() {
            table.add_node(Node::new(*id, peer_endpoint(i + 200)), NodeRelation::Known);
        }

        // Answer the challenge PING with the correct echo.
        let echo = table.ping_expectations.lock().get(&ids[0]).unwrap().echo;
        let accepted = table.handle_pong(
            ids[0],
            &Pong {
                destination: peer_endpoint(200),
                echo,
                expiration: Timestamp::from_now(PACKET_EXPIRATION),
            },
        );

        assert!(accepted);
        assert!(table.evictions.lock().is_empty());
        // Exactly one of incumbent and replacement remains.
        assert!(table.nodes().contains(&ids[0]));
        assert!(!table.nodes().contains(&ids[BUCKET_SIZE]));
        assert!(!table.entry(&ids[0]).unwrap().pending);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_silent_incumbent_is_replaced() {
        let table = started_table().await;
        let seen = Arc::new(StdMutex::new(Vec::new()));
        table.set_event_handler(Box::new(Recorder {
            seen: Arc::clone(&seen),
        }));

        let ids = ids_at_distance(&table.local_id(), 256, BUCKET_SIZE + 1);
        for (i, id) in ids.iter().enumerate() {
            table.add_node(Node::new(*id, peer_endpoint(i + 300)), NodeRelation::Known);
        }

        // Let the challenge time out and the sweep run.
        tokio::time::sleep(REQUEST_TIMEOUT * 3).await;

        assert!(!table.nodes().contains(&ids[0]));
        assert!(table.nodes().contains(&ids[BUCKET_SIZE]));
        {
            let state = table.state.lock();
            let order: Vec<NodeId> = state[255].iter().copied().collect();
            assert_eq!(order.len(), BUCKET_SIZE);
            assert_eq!(*order.last().unwrap(), ids[BUCKET_SIZE]);
        }

        table.process_events();
        let seen = seen.lock().unwrap();
        assert!(seen.contains(&(ids[0], NodeEventKind::Dropped)));
        assert!(seen.contains(&(ids[BUCKET_SIZE], NodeEventKind::Added)));
        let added_at = seen
            .iter()
            .position(|e| *e == (ids[0], NodeEventKind::Added))
            .unwrap();
        let dropped_at = seen
            .iter()
            .position(|e| *e == (ids[0], NodeEventKind::Dropped))
            .unwrap();
        assert!(added_at < dropped_at);
    }

    #[tokio::test]
    async fn test_stale_bucket_slot_is_reclaimed() {
        let table = started_table().await;
        let ids = ids_at_distance(&table.local_id(), 256, BUCKET_SIZE + 1);
        for (i, id) in ids.iter().enumerate().take(BUCKET_SIZE) {
            table.add_node(Node::new(*id, peer_endpoint(i + 400)), NodeRelation::Known);
        }

        // Empty the head's registry slot without sweeping the bucket.
        table.nodes.lock().entries.remove(&ids[0]);

        let newcomer = ids[BUCKET_SIZE];
        table.add_node(
            Node::new(newcomer, peer_endpoint(420)),
            NodeRelation::Known,
        );

        // The stale head gave way without a challenge.
        assert!(table.evictions.lock().is_empty());
        let state = table.state.lock();
        assert!(!state[255].contains(&ids[0]));
        assert!(state[255].contains(&newcomer));
    }

    #[tokio::test]
    async fn test_unsolicited_neighbours_ignored() {
        let table = started_table().await;
        let stranger = NodeId::random();
        let neighbours = Neighbours {
            nodes: vec![Neighbour {
                endpoint: peer_endpoint(500),
                id: NodeId::random(),
            }],
            expiration: Timestamp::from_now(PACKET_EXPIRATION),
        };

        table.handle_neighbours(stranger, peer_endpoint(501).udp_addr(), neighbours);
        assert!(table.nodes().is_empty());
    }

    #[tokio::test]
    async fn test_expected_neighbours_admitted() {
        let table = started_table().await;
        let responder = NodeId::random();
        table
            .find_node_requests
            .lock()
            .push_back((responder, Instant::now()));

        let carried = NodeId::random();
        let neighbours = Neighbours {
            nodes: vec![Neighbour {
                endpoint: peer_endpoint(510),
                id: carried,
            }],
            expiration: Timestamp::from_now(PACKET_EXPIRATION),
        };
        table.handle_neighbours(responder, peer_endpoint(511).udp_addr(), neighbours);

        assert!(table.nodes().contains(&carried));
        assert!(table.entry(&carried).unwrap().pending);
    }

    #[tokio::test]
    async fn test_stale_find_node_rows_pruned() {
        let table = started_table().await;
        let responder = NodeId::random();
        table
            .find_node_requests
            .lock()
            .push_back((responder, Instant::now() - REQUEST_TIMEOUT * 2));

        let neighbours = Neighbours {
            nodes: Vec::new(),
            expiration: Timestamp::from_now(PACKET_EXPIRATION),
        };
        table.handle_neighbours(responder, peer_endpoint(520).udp_addr(), neighbours);

        assert_eq!(table.pending_request_count(), 0);
    }

    #[tokio::test]
    async fn test_pong_with_wrong_echo_rejected() {
        let table = started_table().await;
        let id = NodeId::random();
        table.add_node(Node::new(id, peer_endpoint(530)), NodeRelation::Unknown);

        let accepted = table.handle_pong(
            id,
            &Pong {
                destination: peer_endpoint(530),
                echo: [0xAB; 32],
                expiration: Timestamp::from_now(PACKET_EXPIRATION),
            },
        );
        assert!(!accepted);
        assert!(table.entry(&id).unwrap().pending);
    }

    #[tokio::test]
    async fn test_valid_pong_clears_pending() {
        let table = started_table().await;
        let id = NodeId::random();
        table.add_node(Node::new(id, peer_endpoint(540)), NodeRelation::Unknown);

        let echo = table.ping_expectations.lock().get(&id).unwrap().echo;
        let accepted = table.handle_pong(
            id,
            &Pong {
                destination: peer_endpoint(540),
                echo,
                expiration: Timestamp::from_now(PACKET_EXPIRATION),
            },
        );
        assert!(accepted);
        assert!(!table.entry(&id).unwrap().pending);
    }

    #[tokio::test]
    async fn test_nearest_entries_sorted_and_bounded() {
        let table = started_table().await;
        for i in 0..64 {
            table.add_node(
                Node::new(NodeId::random(), peer_endpoint(i + 600)),
                NodeRelation::Known,
            );
        }

        let target = NodeId::random();
        let nearest = table.nearest_entries(&target);
        assert!(nearest.len() <= BUCKET_SIZE);
        for pair in nearest.windows(2) {
            assert!(
                log_distance(&target, &pair[0].node.id)
                    <= log_distance(&target, &pair[1].node.id)
            );
        }
    }

    #[tokio::test]
    async fn test_dormant_table() {
        let mut config = NodeTableConfig::new(NodeEndpoint::new(
            "127.0.0.1".parse().unwrap(),
            0,
            0,
        ));
        config.enabled = false;
        let table = NodeTable::new(KeyPair::generate(), config);
        table.start().await;

        assert!(!table.is_open());
        // State operations still work against the dormant table.
        let id = NodeId::random();
        table.add_node(Node::new(id, peer_endpoint(700)), NodeRelation::Known);
        assert!(table.nodes().contains(&id));
    }

    #[tokio::test]
    async fn test_drop_node_removes_everywhere() {
        let table = started_table().await;
        let id = NodeId::random();
        table.add_node(Node::new(id, peer_endpoint(710)), NodeRelation::Known);

        table.drop_node(&id);
        assert!(!table.nodes().contains(&id));
        assert!(table.snapshot().is_empty());
    }
}
