//! UDP broadcast discovery (Component C3).
//!
//! Three tasks — broadcaster, listener, cleanup — sharing a [`DiscoveryTable`]
//! and a replay window. Socket setup is grounded in the teacher's
//! `runtime/lan/discovery.rs::bind_reusable_udp`; the loop shapes, timing
//! constants, and replay-protection design come from
//! `original_source/asoc/discovery_binary.py`.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use parking_lot::RwLock;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::identity::NodeIdentity;

pub const DISCOVERY_PORT: u16 = 9999;
pub const BROADCAST_INTERVAL: Duration = Duration::from_secs(3);
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);
const STALE_AFTER: Duration = Duration::from_secs(15);
const REPLAY_WINDOW_LIMIT: usize = 10_000;

/// One live entry in the discovery table: where a peer currently claims to
/// be reachable, and when we last heard from it.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub node_id: NodeIdentity,
    pub addr: std::net::IpAddr,
    pub port: u16,
    pub last_seen: u64,
}

/// Shared table of currently-known discovered peers, keyed by node id.
pub type DiscoveryTable = Arc<RwLock<HashMap<NodeIdentity, DiscoveredPeer>>>;

pub fn new_discovery_table() -> DiscoveryTable {
    Arc::new(RwLock::new(HashMap::new()))
}

/// Replay protection: a bounded set of challenge values already observed.
/// Cleared wholesale once it grows past [`REPLAY_WINDOW_LIMIT`], matching the
/// original prototype's simple bound rather than a time-windowed structure.
type ReplayWindow = Arc<RwLock<HashSet<u32>>>;

fn new_replay_window() -> ReplayWindow {
    Arc::new(RwLock::new(HashSet::new()))
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Bind a UDP socket with `SO_REUSEADDR`/`SO_REUSEPORT` so the discovery port
/// can be shared across processes on the same host during development.
fn bind_reusable_udp(port: u16) -> std::io::Result<UdpSocket> {
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(not(target_os = "windows"))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.set_broadcast(true)?;
    socket.bind(&SockAddr::from(addr))?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// Handle bundling the three discovery tasks and their shared state, returned
/// to the node manager so it can query [`DiscoveryTable::read`] snapshots and
/// cancel the handle's token on shutdown.
pub struct Discovery {
    pub table: DiscoveryTable,
    cancel: CancellationToken,
}

impl Discovery {
    /// Bind the discovery socket and spawn the broadcaster, listener, and
    /// cleanup loops. Returns the handle plus the three `JoinHandle`s so the
    /// caller can await them during shutdown.
    pub fn spawn(
        node_id: NodeIdentity,
        community: String,
        secret: Vec<u8>,
        listen_port: u16,
        parent_cancel: &CancellationToken,
    ) -> std::io::Result<(Self, Vec<tokio::task::JoinHandle<()>>)> {
        let socket = bind_reusable_udp(DISCOVERY_PORT)?;
        let socket = Arc::new(socket);
        let table = new_discovery_table();
        let replay = new_replay_window();
        let cancel = parent_cancel.child_token();

        let mut handles = Vec::with_capacity(3);

        handles.push(tokio::spawn(run_broadcaster(
            socket.clone(),
            node_id,
            community.clone(),
            secret.clone(),
            listen_port,
            cancel.clone(),
        )));

        handles.push(tokio::spawn(run_listener(
            socket,
            node_id,
            community,
            secret,
            table.clone(),
            replay.clone(),
            cancel.clone(),
        )));

        handles.push(tokio::spawn(run_cleanup(table.clone(), replay, cancel.clone())));

        Ok((Self { table, cancel }, handles))
    }

    /// Snapshot of every peer currently considered fresh.
    pub fn peers(&self) -> Vec<DiscoveredPeer> {
        self.table.read().values().cloned().collect()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

async fn run_broadcaster(
    socket: Arc<UdpSocket>,
    node_id: NodeIdentity,
    community: String,
    secret: Vec<u8>,
    listen_port: u16,
    cancel: CancellationToken,
) {
    let broadcast_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, DISCOVERY_PORT));
    info!("discovery broadcaster started on port {}", DISCOVERY_PORT);

    let mut tick = interval(BROADCAST_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let msg = codec::encode_discovery(&community, &node_id, listen_port, &secret, None, None);
                if let Err(e) = socket.send_to(&msg, broadcast_addr).await {
                    warn!("discovery broadcast send failed: {}", e);
                }
            }
        }
    }
    debug!("discovery broadcaster stopped");
}

async fn run_listener(
    socket: Arc<UdpSocket>,
    own_id: NodeIdentity,
    community: String,
    secret: Vec<u8>,
    table: DiscoveryTable,
    replay: ReplayWindow,
    cancel: CancellationToken,
) {
    info!("discovery listener started on port {}", DISCOVERY_PORT);
    let mut buf = [0u8; 1024];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src)) => {
                        handle_datagram(&buf[..len], src, own_id, &community, &secret, &table, &replay);
                    }
                    Err(e) => warn!("discovery recv error: {}", e),
                }
            }
        }
    }
    debug!("discovery listener stopped");
}

fn handle_datagram(
    data: &[u8],
    src: SocketAddr,
    own_id: NodeIdentity,
    community: &str,
    secret: &[u8],
    table: &DiscoveryTable,
    replay: &ReplayWindow,
) {
    let Some(announcement) = codec::decode_discovery(data, community, secret) else {
        return;
    };
    let peer_id = NodeIdentity::from_bytes(announcement.node_id);
    if peer_id == own_id {
        return;
    }

    {
        let mut seen = replay.write();
        if !seen.insert(announcement.challenge) {
            debug!("dropping replayed discovery challenge from {}", peer_id);
            return;
        }
    }

    table.write().insert(
        peer_id,
        DiscoveredPeer {
            node_id: peer_id,
            addr: src.ip(),
            port: announcement.port,
            last_seen: now_unix_secs(),
        },
    );
}

async fn run_cleanup(table: DiscoveryTable, replay: ReplayWindow, cancel: CancellationToken) {
    let mut tick = interval(CLEANUP_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let now = now_unix_secs();
                let stale_after_secs = STALE_AFTER.as_secs();
                let mut writer = table.write();
                let before = writer.len();
                writer.retain(|_, peer| now.saturating_sub(peer.last_seen) < stale_after_secs);
                let removed = before - writer.len();
                drop(writer);
                if removed > 0 {
                    debug!("discovery cleanup pruned {} stale peer(s)", removed);
                }

                let mut seen = replay.write();
                if seen.len() > REPLAY_WINDOW_LIMIT {
                    seen.clear();
                    debug!("discovery replay window exceeded {} entries, cleared", REPLAY_WINDOW_LIMIT);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_datagram_ignores_self_announcements() {
        let id = NodeIdentity::generate();
        let secret = b"secret".to_vec();
        let msg = codec::encode_discovery("community", &id, 9000, &secret, Some(1), Some(2));
        let table = new_discovery_table();
        let replay = new_replay_window();
        handle_datagram(
            &msg,
            "127.0.0.1:9999".parse().unwrap(),
            id,
            "community",
            &secret,
            &table,
            &replay,
        );
        assert!(table.read().is_empty());
    }

    #[test]
    fn handle_datagram_installs_valid_peer() {
        let own_id = NodeIdentity::generate();
        let peer_id = NodeIdentity::generate();
        let secret = b"secret".to_vec();
        let msg = codec::encode_discovery("community", &peer_id, 9001, &secret, Some(1), Some(7));
        let table = new_discovery_table();
        let replay = new_replay_window();
        handle_datagram(
            &msg,
            "127.0.0.1:9999".parse().unwrap(),
            own_id,
            "community",
            &secret,
            &table,
            &replay,
        );
        let peers = table.read();
        let entry = peers.get(&peer_id).expect("peer installed");
        assert_eq!(entry.port, 9001);
    }

    #[test]
    fn handle_datagram_suppresses_replayed_challenge() {
        let own_id = NodeIdentity::generate();
        let peer_id = NodeIdentity::generate();
        let secret = b"secret".to_vec();
        let msg = codec::encode_discovery("community", &peer_id, 9001, &secret, Some(1), Some(99));
        let table = new_discovery_table();
        let replay = new_replay_window();
        let src: SocketAddr = "127.0.0.1:9999".parse().unwrap();

        handle_datagram(&msg, src, own_id, "community", &secret, &table, &replay);
        table.write().clear();
        handle_datagram(&msg, src, own_id, "community", &secret, &table, &replay);

        assert!(table.read().is_empty(), "replayed challenge must not re-install the peer");
    }

    #[test]
    fn handle_datagram_drops_wrong_community() {
        let own_id = NodeIdentity::generate();
        let peer_id = NodeIdentity::generate();
        let secret = b"secret".to_vec();
        let msg = codec::encode_discovery("community-a", &peer_id, 9001, &secret, Some(1), Some(3));
        let table = new_discovery_table();
        let replay = new_replay_window();
        handle_datagram(
            &msg,
            "127.0.0.1:9999".parse().unwrap(),
            own_id,
            "community-b",
            &secret,
            &table,
            &replay,
        );
        assert!(table.read().is_empty());
    }
}
