//! LAN discovery: UDP broadcast beacon, peer table, targeted lookup.
//!
//! Three loops share one broadcast socket: a beacon announcing this device
//! every few seconds, a receiver folding datagrams into the peer table, and
//! an eviction sweep dropping peers whose beacons stopped. Targeted lookup
//! broadcasts a `discover` for one device id; only that device answers,
//! unicast, which is how the reconnect supervisor finds a peer whose IP
//! changed.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use landrop_core::record::now_secs;
use landrop_core::PROTOCOL_VERSION;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::engine::Shared;
use crate::events::Event;

const BEACON_INTERVAL: Duration = Duration::from_secs(5);
const PEER_TIMEOUT: Duration = Duration::from_secs(15);
/// Datagrams repeating within this window are duplicates, not news.
const DUPLICATE_WINDOW: Duration = Duration::from_secs(1);

/// Discovery datagrams. Plain JSON, one message per datagram.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryMessage {
    Announce {
        device_id: String,
        hostname: String,
        tcp_port: u16,
        protocol_version: u32,
    },
    Discover {
        target_device_id: String,
    },
    DiscoverResponse {
        device_id: String,
        hostname: String,
        tcp_port: u16,
        protocol_version: u32,
    },
}

/// In-memory peer table entry.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub hostname: String,
    pub addr: SocketAddr,
    pub last_seen: Instant,
    pub last_beacon_at: u64,
}

/// A peer as reported to the UI.
#[derive(Debug, Clone)]
pub struct DiscoveredPeer {
    pub device_id: String,
    pub hostname: String,
    pub addr: SocketAddr,
    pub last_beacon_at: u64,
}

/// Snapshot the peer table for `list_peers()`.
pub fn snapshot(peers: &HashMap<String, PeerEntry>) -> Vec<DiscoveredPeer> {
    peers
        .iter()
        .map(|(id, e)| DiscoveredPeer {
            device_id: id.clone(),
            hostname: e.hostname.clone(),
            addr: e.addr,
            last_beacon_at: e.last_beacon_at,
        })
        .collect()
}

pub async fn run_discovery(shared: Arc<Shared>) -> std::io::Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", shared.config.udp_port)).await?;
    socket.set_broadcast(true)?;
    let socket = Arc::new(socket);

    let beacon_shared = shared.clone();
    let beacon_socket = socket.clone();
    let beacon_task = tokio::spawn(async move { beacon_loop(beacon_shared, beacon_socket).await });

    let recv_shared = shared.clone();
    let recv_socket = socket.clone();
    let recv_task = tokio::spawn(async move { recv_loop(recv_shared, recv_socket).await });

    let evict_task = tokio::spawn(async move { evict_loop(shared).await });

    let _ = tokio::try_join!(beacon_task, recv_task, evict_task);
    Ok(())
}

fn broadcast_addr(udp_port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), udp_port)
}

async fn beacon_loop(shared: Arc<Shared>, socket: Arc<UdpSocket>) -> std::io::Result<()> {
    let beacon = DiscoveryMessage::Announce {
        device_id: shared.identity.device_id.clone(),
        hostname: shared.identity.hostname.clone(),
        tcp_port: shared.config.tcp_port,
        protocol_version: PROTOCOL_VERSION,
    };
    let payload = serde_json::to_vec(&beacon)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let dest = broadcast_addr(shared.config.udp_port);
    loop {
        if let Err(e) = socket.send_to(&payload, dest).await {
            warn!("beacon send failed: {e}");
        }
        tokio::time::sleep(BEACON_INTERVAL).await;
    }
}

async fn recv_loop(shared: Arc<Shared>, socket: Arc<UdpSocket>) -> std::io::Result<()> {
    let mut buf = vec![0u8; 2048];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        handle_datagram(&shared, &socket, &buf[..n], from).await;
    }
}

/// Fold one datagram into the peer table / lookup table.
async fn handle_datagram(shared: &Shared, socket: &UdpSocket, data: &[u8], from: SocketAddr) {
    let msg: DiscoveryMessage = match serde_json::from_slice(data) {
        Ok(m) => m,
        Err(_) => {
            debug!("ignoring malformed discovery datagram from {from}");
            return;
        }
    };
    match msg {
        DiscoveryMessage::Announce {
            device_id,
            hostname,
            tcp_port,
            protocol_version,
        }
        | DiscoveryMessage::DiscoverResponse {
            device_id,
            hostname,
            tcp_port,
            protocol_version,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                return;
            }
            if device_id == shared.identity.device_id {
                return;
            }
            let addr = SocketAddr::new(from.ip(), tcp_port);
            record_peer(shared, device_id, hostname, addr).await;
        }
        DiscoveryMessage::Discover { target_device_id } => {
            if target_device_id != shared.identity.device_id {
                return;
            }
            let response = DiscoveryMessage::DiscoverResponse {
                device_id: shared.identity.device_id.clone(),
                hostname: shared.identity.hostname.clone(),
                tcp_port: shared.config.tcp_port,
                protocol_version: PROTOCOL_VERSION,
            };
            if let Ok(payload) = serde_json::to_vec(&response) {
                let _ = socket.send_to(&payload, from).await;
            }
        }
    }
}

async fn record_peer(shared: &Shared, device_id: String, hostname: String, addr: SocketAddr) {
    let is_news = {
        let mut peers = shared.peers.lock().await;
        match peers.get_mut(&device_id) {
            Some(entry) => {
                let duplicate =
                    entry.addr == addr && entry.last_seen.elapsed() < DUPLICATE_WINDOW;
                let moved = entry.addr != addr;
                entry.hostname = hostname.clone();
                entry.addr = addr;
                entry.last_seen = Instant::now();
                if !duplicate {
                    entry.last_beacon_at = now_secs();
                }
                moved
            }
            None => {
                peers.insert(
                    device_id.clone(),
                    PeerEntry {
                        hostname: hostname.clone(),
                        addr,
                        last_seen: Instant::now(),
                        last_beacon_at: now_secs(),
                    },
                );
                true
            }
        }
    };
    // Anyone waiting on a targeted lookup for this device is done waiting.
    let waiters = shared.lookups.lock().await.remove(&device_id);
    if let Some(waiters) = waiters {
        for tx in waiters {
            let _ = tx.send(addr);
        }
    }
    if is_news {
        debug!("discovered {device_id} at {addr}");
        shared.emit(Event::PeerDiscovered {
            device_id,
            hostname,
            addr,
        });
    }
}

async fn evict_loop(shared: Arc<Shared>) -> std::io::Result<()> {
    loop {
        tokio::time::sleep(BEACON_INTERVAL).await;
        let lost: Vec<String> = {
            let mut peers = shared.peers.lock().await;
            let gone: Vec<String> = peers
                .iter()
                .filter(|(_, e)| e.last_seen.elapsed() >= PEER_TIMEOUT)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &gone {
                peers.remove(id);
            }
            gone
        };
        for device_id in lost {
            debug!("peer {device_id} timed out");
            shared.emit(Event::PeerLost { device_id });
        }
    }
}

/// Broadcast a targeted `discover` and wait for the device to answer (or
/// for its regular beacon to arrive first). Used when a trusted peer's last
/// known IP stopped answering.
pub async fn lookup(
    shared: &Arc<Shared>,
    target_device_id: &str,
    timeout: Duration,
) -> Option<SocketAddr> {
    // A beacon may already have refreshed the table.
    if let Some(entry) = shared.peers.lock().await.get(target_device_id) {
        if entry.last_seen.elapsed() < PEER_TIMEOUT {
            return Some(entry.addr);
        }
    }
    let (tx, rx) = tokio::sync::oneshot::channel();
    shared
        .lookups
        .lock()
        .await
        .entry(target_device_id.to_string())
        .or_default()
        .push(tx);
    let probe = DiscoveryMessage::Discover {
        target_device_id: target_device_id.to_string(),
    };
    let payload = serde_json::to_vec(&probe).ok()?;
    let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
        Ok(s) => s,
        Err(e) => {
            warn!("lookup socket bind failed: {e}");
            return None;
        }
    };
    if socket.set_broadcast(true).is_err() {
        return None;
    }
    let _ = socket
        .send_to(&payload, broadcast_addr(shared.config.udp_port))
        .await;
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(addr)) => Some(addr),
        _ => {
            // Expired waiter; drop our slot if it is still registered.
            let mut lookups = shared.lookups.lock().await;
            if let Some(waiters) = lookups.get_mut(target_device_id) {
                waiters.retain(|w| !w.is_closed());
                if waiters.is_empty() {
                    lookups.remove(target_device_id);
                }
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_shared;

    #[test]
    fn datagram_json_shape() {
        let msg = DiscoveryMessage::Announce {
            device_id: "atlas-kim-1".into(),
            hostname: "atlas".into(),
            tcp_port: 9527,
            protocol_version: PROTOCOL_VERSION,
        };
        let v: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "announce");
        assert_eq!(v["tcp_port"], 9527);
        let probe = DiscoveryMessage::Discover {
            target_device_id: "B-u-2222".into(),
        };
        let v = serde_json::to_value(&probe).unwrap();
        assert_eq!(v["type"], "discover");
    }

    #[tokio::test]
    async fn announce_populates_peer_table_and_wakes_lookups() {
        let (shared, _guard) = test_shared().await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let from: SocketAddr = "192.168.1.25:40000".parse().unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        shared
            .lookups
            .lock()
            .await
            .insert("B-u-2222".into(), vec![tx]);

        let msg = DiscoveryMessage::Announce {
            device_id: "B-u-2222".into(),
            hostname: "bravo".into(),
            tcp_port: 9527,
            protocol_version: PROTOCOL_VERSION,
        };
        let data = serde_json::to_vec(&msg).unwrap();
        handle_datagram(&shared, &socket, &data, from).await;

        let peers = shared.peers.lock().await;
        let entry = peers.get("B-u-2222").unwrap();
        assert_eq!(entry.addr, "192.168.1.25:9527".parse().unwrap());
        drop(peers);
        assert_eq!(rx.await.unwrap(), "192.168.1.25:9527".parse().unwrap());
    }

    #[tokio::test]
    async fn self_announce_and_version_mismatch_ignored() {
        let (shared, _guard) = test_shared().await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let from: SocketAddr = "192.168.1.30:40000".parse().unwrap();

        let own = DiscoveryMessage::Announce {
            device_id: shared.identity.device_id.clone(),
            hostname: "self".into(),
            tcp_port: 9527,
            protocol_version: PROTOCOL_VERSION,
        };
        handle_datagram(&shared, &socket, &serde_json::to_vec(&own).unwrap(), from).await;

        let stale = DiscoveryMessage::Announce {
            device_id: "old-u-9999".into(),
            hostname: "old".into(),
            tcp_port: 9527,
            protocol_version: PROTOCOL_VERSION + 1,
        };
        handle_datagram(&shared, &socket, &serde_json::to_vec(&stale).unwrap(), from).await;

        assert!(shared.peers.lock().await.is_empty());
    }

    #[tokio::test]
    async fn discover_for_us_is_answered_unicast() {
        let (shared, _guard) = test_shared().await;
        let service = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let asker = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let asker_addr = asker.local_addr().unwrap();

        let probe = DiscoveryMessage::Discover {
            target_device_id: shared.identity.device_id.clone(),
        };
        handle_datagram(
            &shared,
            &service,
            &serde_json::to_vec(&probe).unwrap(),
            asker_addr,
        )
        .await;

        let mut buf = [0u8; 1024];
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), asker.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply: DiscoveryMessage = serde_json::from_slice(&buf[..n]).unwrap();
        match reply {
            DiscoveryMessage::DiscoverResponse { device_id, tcp_port, .. } => {
                assert_eq!(device_id, shared.identity.device_id);
                assert_eq!(tcp_port, shared.config.tcp_port);
            }
            other => panic!("expected DiscoverResponse, got {other:?}"),
        }
    }
}
