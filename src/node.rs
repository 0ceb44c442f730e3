//! Node manager (Component C4): the accept loop, outbound connectors,
//! handshake state machines, PeerTable, stream-id allocator, and the
//! per-connection receive loop.
//!
//! This is the orchestration layer of the crate. Its task-spawning and
//! shutdown shape is grounded in the teacher's `runtime/lan/mod.rs`
//! (`LanTasks` bundling a `CancellationToken` with a set of `JoinHandle`s)
//! and its event-channel API in `GUI/src/runtime/mod.rs`'s
//! `RuntimeWorker`/`RuntimeEvent` pattern. The handshake state machines
//! themselves, the stream-id allocator, and the dedup rules are grounded in
//! `original_source/asoc/node_ready.py`'s `NodeReady` class.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;

use crate::codec::{
    self, FRAME_ACCEPT, FRAME_CONTROL, FRAME_DATA, FRAME_END, FRAME_HELLO,
};
use crate::config::NodeConfig;
use crate::connection::{Connection, HANDSHAKE_TIMEOUT, STEADY_STATE_RECV_TIMEOUT};
use crate::discovery::Discovery;
use crate::error::AsocError;
use crate::identity::NodeIdentity;
use crate::stream;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const STATIC_RETRY_INTERVAL: Duration = Duration::from_secs(10);
const DISCOVERY_CONNECTOR_INTERVAL: Duration = Duration::from_secs(2);

/// Identifies a PeerTable entry. Most peers are keyed by identity as soon as
/// the handshake completes; an outbound connection whose peer only returned
/// the base (non-extended) ACCEPT payload has no identity yet and is keyed
/// provisionally by address, per spec §9.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerKey {
    Identity(NodeIdentity),
    Provisional(String),
}

impl std::fmt::Display for PeerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerKey::Identity(id) => write!(f, "{id}"),
            PeerKey::Provisional(addr) => write!(f, "temp:{addr}"),
        }
    }
}

/// Which side of a connection this node was, for that connection: the
/// dialer ("client") or the accepter ("server"). Determines which half of
/// the stream-id space this node allocates from on that connection, and
/// breaks the tie when two nodes end up with two physical sockets between
/// them at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerDirection {
    Inbound,
    Outbound,
}

impl PeerDirection {
    /// First stream id this node allocates on a connection of this
    /// direction. Outbound (dialer) gets the odd space starting at 1,
    /// inbound (accepter) gets the even space starting at 2, mirroring the
    /// client/server stream-id parity convention — stream id 0 stays
    /// reserved for handshake frames either way.
    fn initial_stream_id(self) -> u32 {
        match self {
            PeerDirection::Outbound => 1,
            PeerDirection::Inbound => 2,
        }
    }
}

struct PeerEntry {
    connection: Arc<Connection>,
    addr: String,
    direction: PeerDirection,
    next_stream_id: Arc<Mutex<u32>>,
    #[allow(dead_code)] // retained per spec glossary; not consulted on DATA frames
    session_token: [u8; 8],
}

type PeerTable = Arc<RwLock<HashMap<PeerKey, PeerEntry>>>;

/// Result of attempting to install a freshly handshaken connection into the
/// PeerTable, accounting for an existing connection already present under
/// the same key.
enum InstallOutcome {
    Installed,
    /// The new connection took over the key from a previously-installed,
    /// non-preferred-direction connection, which the caller must close.
    Replaced(Arc<Connection>),
    Rejected,
}

/// Insert `new_entry` under `key`, resolving a collision against whatever
/// is already there.
///
/// With no existing entry, installs unconditionally. With an existing
/// entry, replaces it only if `new_entry`'s direction matches `preferred`
/// and the existing one's doesn't — i.e. only to *upgrade* towards the
/// direction both ends are expected to agree on (see `preferred_direction`)
/// — otherwise the newcomer is rejected. `preferred` is `None` when the
/// peer's identity isn't known yet (a non-extended ACCEPT from a minimal
/// peer), in which case any existing entry simply wins.
fn install_peer(
    peers: &PeerTable,
    key: &PeerKey,
    new_entry: PeerEntry,
    preferred: Option<PeerDirection>,
) -> InstallOutcome {
    let mut table = peers.write();
    match table.get(key) {
        None => {
            table.insert(key.clone(), new_entry);
            InstallOutcome::Installed
        }
        Some(existing) => {
            let should_replace = match preferred {
                Some(pref) => new_entry.direction == pref && existing.direction != pref,
                None => false,
            };
            if should_replace {
                let old = table.insert(key.clone(), new_entry).expect("checked Some above");
                InstallOutcome::Replaced(old.connection)
            } else {
                InstallOutcome::Rejected
            }
        }
    }
}

/// Which connection direction *this* node prefers to keep for a peer of
/// known identity `peer`, given its own `own` identity. Both ends of a pair
/// compute this from the same two identities, so they always agree: the
/// lexicographically greater identity keeps its outbound connection, the
/// lesser keeps its inbound one — both names for the same physical socket,
/// so a mutual dial race always converges on exactly one connection without
/// needing to know anything about either side's bound address (contrast
/// with comparing `host:port` strings, which collapses to the same ordering
/// on both sides whenever both nodes share the same default listen host).
fn preferred_direction(own: &NodeIdentity, peer: &NodeIdentity) -> PeerDirection {
    if own.to_text() > peer.to_text() {
        PeerDirection::Outbound
    } else {
        PeerDirection::Inbound
    }
}

/// Events emitted to whoever is consuming the node's data plane — the
/// channel-based handoff mirrors the teacher's `RuntimeEvent` pattern.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerConnected(PeerKey),
    PeerDisconnected(PeerKey),
    Data {
        peer: PeerKey,
        stream_id: u32,
        seq: u32,
        payload: Vec<u8>,
    },
    StreamEnd {
        peer: PeerKey,
        stream_id: u32,
        seq: u32,
    },
}

/// Shared node state. Always accessed through an `Arc` so background tasks
/// can hold their own handle independent of the `NodeHandle` the operator
/// holds.
struct Node {
    identity: NodeIdentity,
    community: String,
    secret: Vec<u8>,
    max_payload: usize,
    chunk_size: usize,
    send_gate: usize,
    peers: PeerTable,
    connected_addrs: Mutex<HashSet<String>>,
    events: mpsc::Sender<NodeEvent>,
    cancel: CancellationToken,
    running: AtomicBool,
}

impl Node {
    fn emit(&self, event: NodeEvent) {
        let _ = self.events.try_send(event);
    }
}

/// The operator-facing handle to a running node.
pub struct NodeHandle {
    node: Arc<Node>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl NodeHandle {
    /// Start a node per `config`. Returns the handle plus the event stream
    /// the caller should drain to observe `DATA`/`END`/connection events.
    pub async fn spawn(config: NodeConfig) -> anyhow::Result<(Self, mpsc::Receiver<NodeEvent>)> {
        let identity = match &config.node_id {
            Some(text) => NodeIdentity::parse(text)?,
            None => NodeIdentity::generate(),
        };
        let host: IpAddr = config
            .host
            .parse()
            .map_err(|_| AsocError::ConfigInvalid(format!("invalid host {:?}", config.host)))?;

        let (events_tx, events_rx) = mpsc::channel(1024);
        let cancel = CancellationToken::new();

        let node = Arc::new(Node {
            identity,
            community: config.community.clone(),
            secret: config.secret.clone().into_bytes(),
            max_payload: config.max_payload,
            chunk_size: config.chunk_size,
            send_gate: config.send_gate,
            peers: Arc::new(RwLock::new(HashMap::new())),
            connected_addrs: Mutex::new(HashSet::new()),
            events: events_tx,
            cancel: cancel.clone(),
            running: AtomicBool::new(true),
        });

        info!(
            "starting node {} (community={:?}, listen={}:{})",
            node.identity, node.community, host, config.port
        );

        let mut tasks = Vec::new();

        let listener = bind_reusable_tcp(host, config.port)?;
        tasks.push(tokio::spawn(run_accept_loop(node.clone(), listener)));

        let static_peers = config.static_peer_addrs();
        if !static_peers.is_empty() {
            info!("static peers configured: {}", static_peers.len());
            let node_for_static = node.clone();
            let addrs: Vec<(String, u16)> = static_peers
                .into_iter()
                .map(|p| (p.host, p.port))
                .collect();
            tasks.push(tokio::spawn(run_static_connector(node_for_static, addrs)));
        }

        if config.effective_discovery() {
            info!("discovery enabled");
            let (discovery, discovery_tasks) = Discovery::spawn(
                node.identity,
                node.community.clone(),
                node.secret.clone(),
                config.port,
                &cancel,
            )?;
            tasks.extend(discovery_tasks);
            let table = discovery.table.clone();
            tasks.push(tokio::spawn(run_discovery_connector(node.clone(), table)));
        } else {
            info!("discovery disabled");
        }

        Ok((Self { node, tasks }, events_rx))
    }

    /// Text-form identities of every established (non-provisional) peer.
    pub fn peer_ids(&self) -> Vec<String> {
        self.node
            .peers
            .read()
            .keys()
            .filter_map(|k| match k {
                PeerKey::Identity(id) => Some(id.to_text()),
                PeerKey::Provisional(_) => None,
            })
            .collect()
    }

    pub fn identity(&self) -> NodeIdentity {
        self.node.identity
    }

    /// Chunk `payload` into DATA frames followed by an END frame, sent to
    /// `peer_id_text`'s connection.
    pub async fn send_stream(
        &self,
        peer_id_text: &str,
        payload: &[u8],
        stream_id: Option<u32>,
        chunk_size: Option<usize>,
    ) -> Result<(), AsocError> {
        if !self.node.running.load(Ordering::Acquire) {
            return Err(AsocError::Stopped);
        }
        let peer_id = NodeIdentity::parse(peer_id_text).map_err(|_| AsocError::NoPeer)?;
        let (conn, next_stream_id) = {
            let table = self.node.peers.read();
            table
                .get(&PeerKey::Identity(peer_id))
                .map(|entry| (entry.connection.clone(), entry.next_stream_id.clone()))
        }
        .ok_or(AsocError::NoPeer)?;

        // Each connection allocates from its own odd (outbound) or even
        // (inbound) half of the id space, so ids this node assigns can
        // never collide with ids the peer assigns on its own sends over
        // the same connection.
        let sid = match stream_id {
            Some(id) => id,
            None => {
                let mut next = next_stream_id.lock();
                let id = *next;
                *next = next.wrapping_add(2);
                id
            }
        };
        let chunk = chunk_size.unwrap_or(self.node.chunk_size);
        stream::send_stream(&conn, sid, payload, chunk).await
    }

    /// Close the listening socket, every peer connection, and every
    /// background task. Idempotent-ish: safe to call once; a second call
    /// just re-cancels an already-cancelled token and awaits already-finished
    /// tasks.
    pub async fn shutdown(mut self) {
        info!("shutting down node {}", self.node.identity);
        self.node.running.store(false, Ordering::Release);
        self.node.cancel.cancel();

        for task in self.tasks.drain(..) {
            let _ = task.await;
        }

        let mut table = self.node.peers.write();
        for (_, entry) in table.drain() {
            entry.connection.close();
        }
    }
}

fn bind_reusable_tcp(host: IpAddr, port: u16) -> std::io::Result<TcpListener> {
    let domain = if host.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(not(target_os = "windows"))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(SocketAddr::new(host, port)))?;
    socket.listen(1024)?;
    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

async fn run_accept_loop(node: Arc<Node>, listener: TcpListener) {
    info!("accept loop listening on {:?}", listener.local_addr().ok());
    loop {
        tokio::select! {
            _ = node.cancel.cancelled() => break,
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        tokio::spawn(run_inbound_handshake(node.clone(), stream, peer_addr));
                    }
                    Err(e) => warn!("accept error: {}", e),
                }
            }
        }
    }
    debug!("accept loop stopped");
}

async fn run_inbound_handshake(node: Arc<Node>, stream: TcpStream, peer_addr: SocketAddr) {
    let conn = Arc::new(Connection::with_gate(stream, node.max_payload, node.send_gate));

    let frame = match conn.recv_frame(HANDSHAKE_TIMEOUT).await {
        Ok(f) => f,
        Err(e) => {
            debug!("inbound handshake from {} failed to receive HELLO: {}", peer_addr, e);
            conn.close();
            return;
        }
    };

    if frame.frame_type != FRAME_HELLO || !codec::verify_hello(&frame.payload, &node.secret) {
        debug!("inbound handshake from {} rejected (bad HELLO)", peer_addr);
        conn.close();
        return;
    }

    let (node_id_bytes, _tag, _challenge) = match codec::decode_hello(&frame.payload) {
        Ok(v) => v,
        Err(_) => {
            conn.close();
            return;
        }
    };
    let peer_id = NodeIdentity::from_bytes(node_id_bytes);
    if peer_id == node.identity {
        warn!("rejecting self-loop connection from {}", peer_addr);
        conn.close();
        return;
    }

    let (accept_payload, token) = codec::encode_accept_with_identity(&node.secret, &node.identity);
    if let Err(e) = conn.send_frame(FRAME_ACCEPT, 0, 0, &accept_payload).await {
        debug!("inbound handshake with {} failed to send ACCEPT: {}", peer_id, e);
        conn.close();
        return;
    }

    let key = PeerKey::Identity(peer_id);
    let preferred = preferred_direction(&node.identity, &peer_id);
    let new_entry = PeerEntry {
        connection: conn.clone(),
        addr: peer_addr.to_string(),
        direction: PeerDirection::Inbound,
        next_stream_id: Arc::new(Mutex::new(PeerDirection::Inbound.initial_stream_id())),
        session_token: token,
    };
    match install_peer(&node.peers, &key, new_entry, Some(preferred)) {
        InstallOutcome::Rejected => {
            debug!("rejecting duplicate inbound connection from {}", peer_id);
            conn.close();
            return;
        }
        InstallOutcome::Replaced(old_conn) => {
            debug!(
                "inbound connection from {} superseded a non-preferred existing connection",
                peer_id
            );
            old_conn.close();
        }
        InstallOutcome::Installed => {}
    }

    info!("peer connected (inbound): {}", peer_id);
    node.emit(NodeEvent::PeerConnected(key.clone()));
    run_receive_loop(node, conn, key).await;
}

async fn run_static_connector(node: Arc<Node>, addrs: Vec<(String, u16)>) {
    let mut tick = interval(STATIC_RETRY_INTERVAL);
    loop {
        tokio::select! {
            _ = node.cancel.cancelled() => break,
            _ = tick.tick() => {
                for (host, port) in &addrs {
                    let target = format!("{host}:{port}");

                    // Static peers are always dialed unconditionally per the
                    // configured list; a mutual pair dialing each other at
                    // once is resolved after both handshakes complete, not
                    // by skipping the dial (see `preferred_direction`).
                    if node.connected_addrs.lock().contains(&target) {
                        continue;
                    }
                    tokio::spawn(run_outbound_handshake(node.clone(), host.clone(), *port));
                }
            }
        }
    }
    debug!("static connector stopped");
}

async fn run_discovery_connector(node: Arc<Node>, table: crate::discovery::DiscoveryTable) {
    let mut tick = interval(DISCOVERY_CONNECTOR_INTERVAL);
    loop {
        tokio::select! {
            _ = node.cancel.cancelled() => break,
            _ = tick.tick() => {
                let snapshot: Vec<_> = table.read().values().cloned().collect();
                for peer in snapshot {
                    if node.peers.read().contains_key(&PeerKey::Identity(peer.node_id)) {
                        continue;
                    }
                    tokio::spawn(run_outbound_handshake(
                        node.clone(),
                        peer.addr.to_string(),
                        peer.port,
                    ));
                }
            }
        }
    }
    debug!("discovery connector stopped");
}

async fn run_outbound_handshake(node: Arc<Node>, host: String, port: u16) {
    let target = format!("{host}:{port}");

    let stream = match timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!("outbound connect to {} failed: {}", target, e);
            return;
        }
        Err(_) => {
            debug!("outbound connect to {} timed out", target);
            return;
        }
    };

    let conn = Arc::new(Connection::with_gate(stream, node.max_payload, node.send_gate));

    let hello = codec::encode_hello(&node.identity, &node.secret, None);
    if let Err(e) = conn.send_frame(FRAME_HELLO, 0, 0, &hello).await {
        debug!("outbound handshake to {} failed to send HELLO: {}", target, e);
        conn.close();
        return;
    }

    let frame = match conn.recv_frame(HANDSHAKE_TIMEOUT).await {
        Ok(f) => f,
        Err(e) => {
            debug!("outbound handshake to {} failed to receive ACCEPT: {}", target, e);
            conn.close();
            return;
        }
    };
    if frame.frame_type != FRAME_ACCEPT {
        debug!("outbound handshake to {} got non-ACCEPT reply", target);
        conn.close();
        return;
    }

    let (token, maybe_id) = match codec::decode_accept_extended(&frame.payload, &node.secret) {
        Some(v) => v,
        None => {
            debug!("outbound handshake to {} got invalid ACCEPT", target);
            conn.close();
            return;
        }
    };

    if maybe_id == Some(node.identity) {
        warn!("rejecting self-loop connection to {}", target);
        conn.close();
        return;
    }

    let key = match maybe_id {
        Some(id) => PeerKey::Identity(id),
        None => PeerKey::Provisional(target.clone()),
    };
    let preferred = maybe_id.map(|id| preferred_direction(&node.identity, &id));
    let new_entry = PeerEntry {
        connection: conn.clone(),
        addr: target.clone(),
        direction: PeerDirection::Outbound,
        next_stream_id: Arc::new(Mutex::new(PeerDirection::Outbound.initial_stream_id())),
        session_token: token,
    };
    match install_peer(&node.peers, &key, new_entry, preferred) {
        InstallOutcome::Rejected => {
            debug!("rejecting duplicate outbound connection to {}", target);
            conn.close();
            return;
        }
        InstallOutcome::Replaced(old_conn) => {
            debug!(
                "outbound connection to {} superseded a non-preferred existing connection",
                target
            );
            old_conn.close();
        }
        InstallOutcome::Installed => {}
    }
    node.connected_addrs.lock().insert(target.clone());

    info!("peer connected (outbound): {} ({})", key, target);
    node.emit(NodeEvent::PeerConnected(key.clone()));
    run_receive_loop(node, conn, key).await;
}

async fn run_receive_loop(node: Arc<Node>, conn: Arc<Connection>, key: PeerKey) {
    loop {
        match conn.recv_frame(STEADY_STATE_RECV_TIMEOUT).await {
            Ok(frame) => match frame.frame_type {
                FRAME_DATA => node.emit(NodeEvent::Data {
                    peer: key.clone(),
                    stream_id: frame.stream_id,
                    seq: frame.seq,
                    payload: frame.payload,
                }),
                FRAME_END => node.emit(NodeEvent::StreamEnd {
                    peer: key.clone(),
                    stream_id: frame.stream_id,
                    seq: frame.seq,
                }),
                FRAME_CONTROL => {}
                FRAME_HELLO | FRAME_ACCEPT => {
                    warn!("protocol violation from {}: handshake frame after Established", key);
                    break;
                }
                other => {
                    warn!("unknown frame type {} from {}", other, key);
                    break;
                }
            },
            Err(e) => {
                debug!("receive loop for {} ending: {}", key, e);
                break;
            }
        }
    }

    // Only remove the table entry if it's still *this* connection: a
    // connection that lost an install-time collision keeps running until its
    // own recv errors or times out, by which point a winning replacement may
    // already occupy this key and must not be clobbered.
    let addr = {
        let mut table = node.peers.write();
        match table.get(&key) {
            Some(entry) if Arc::ptr_eq(&entry.connection, &conn) => {
                table.remove(&key).map(|entry| entry.addr)
            }
            _ => None,
        }
    };
    conn.close();
    if let Some(addr) = addr {
        node.connected_addrs.lock().remove(&addr);
        node.emit(NodeEvent::PeerDisconnected(key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;
    use tokio::time::sleep;

    fn test_config(port: u16, peers: Vec<String>) -> NodeConfig {
        NodeConfig {
            community: "test-community".into(),
            secret: "test-secret".into(),
            node_id: None,
            host: "127.0.0.1".into(),
            port,
            peers,
            discovery: Some(false),
            chunk_size: 64 * 1024,
            max_payload: codec::DEFAULT_MAX_PAYLOAD,
            send_gate: crate::connection::DEFAULT_SEND_GATE,
        }
    }

    #[tokio::test]
    async fn two_static_peers_establish_bidirectional_connection() {
        let port_a = 19001;
        let port_b = 19002;

        let (handle_a, mut events_a) = NodeHandle::spawn(test_config(
            port_a,
            vec![format!("127.0.0.1:{port_b}")],
        ))
        .await
        .unwrap();
        let (handle_b, mut events_b) = NodeHandle::spawn(test_config(
            port_b,
            vec![format!("127.0.0.1:{port_a}")],
        ))
        .await
        .unwrap();

        // Static connector fires every 10s in production; wait for the
        // handshake to land within a generous bound for the test.
        let deadline = tokio::time::Instant::now() + StdDuration::from_secs(15);
        loop {
            if !handle_a.peer_ids().is_empty() && !handle_b.peer_ids().is_empty() {
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("peers did not connect in time");
            }
            sleep(StdDuration::from_millis(50)).await;
        }

        let peer_id_on_a = handle_a.peer_ids().remove(0);
        handle_a
            .send_stream(&peer_id_on_a, b"hello-world", None, None)
            .await
            .unwrap();

        let mut collected = Vec::new();
        loop {
            match events_b.recv().await.unwrap() {
                NodeEvent::Data { payload, .. } => collected.extend_from_slice(&payload),
                NodeEvent::StreamEnd { .. } => break,
                _ => {}
            }
        }
        assert_eq!(collected, b"hello-world");

        // Drain any pending connection events on A so shutdown doesn't race.
        while events_a.try_recv().is_ok() {}

        handle_a.shutdown().await;
        handle_b.shutdown().await;
    }

    #[tokio::test]
    async fn send_stream_to_unknown_peer_fails() {
        let (handle, _events) = NodeHandle::spawn(test_config(19010, vec![])).await.unwrap();
        let random_id = NodeIdentity::generate().to_text();
        let err = handle
            .send_stream(&random_id, b"x", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AsocError::NoPeer));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn fresh_node_has_no_peers() {
        let (handle, _events) = NodeHandle::spawn(test_config(19011, vec![])).await.unwrap();
        assert!(handle.peer_ids().is_empty());
        handle.shutdown().await;
    }
}
