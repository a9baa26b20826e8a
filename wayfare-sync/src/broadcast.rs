//! Fan-out of relay frames to N-1 peers with backpressure.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each peer gets an independent receiver that buffers up to `capacity`
//! frames; a peer that falls further behind loses the oldest ones.
//!
//! Reference: Patterson & Hennessy, Section 6.4 — Interconnection Networks

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

/// One text frame and the peer that sent it.
#[derive(Debug, Clone)]
pub struct Frame {
    pub sender: Uuid,
    pub text: Arc<str>,
}

impl Frame {
    pub fn new(sender: Uuid, text: &str) -> Self {
        Self {
            sender,
            text: Arc::from(text),
        }
    }
}

/// A connected relay peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub remote_addr: Option<SocketAddr>,
}

impl PeerInfo {
    pub fn new(remote_addr: Option<SocketAddr>) -> Self {
        Self {
            peer_id: Uuid::new_v4(),
            remote_addr,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub active_peers: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Add a peer and return its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Frame> {
        let mut peers = self.peers.write().await;
        peers.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    /// Send to every receiver, sender included; receivers skip their own frames.
    ///
    /// Returns the number of receivers.
    pub fn broadcast(&self, frame: Frame) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.stats.frames_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            active_peers: self.peer_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps room names to broadcast groups, isolating rooms from each other.
pub struct RoomManager {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, room: &str) -> Arc<BroadcastGroup> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(group) = rooms.get(room) {
                return group.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(group) = rooms.get(room) {
            return group.clone();
        }
        let group = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(room.to_string(), group.clone());
        log::debug!("Room '{room}' created");
        group
    }

    /// Add a peer to a room, creating the room if needed.
    ///
    /// Runs under the room map's write lock so a concurrent last-peer
    /// cleanup can't retire the group between lookup and insert. Returns
    /// `None` when the room already holds `max_peers`.
    pub async fn join(
        &self,
        room: &str,
        info: PeerInfo,
        max_peers: usize,
    ) -> Option<(Arc<BroadcastGroup>, broadcast::Receiver<Frame>)> {
        let mut rooms = self.rooms.write().await;
        let group = match rooms.get(room) {
            Some(group) => group.clone(),
            None => {
                let group = Arc::new(BroadcastGroup::new(self.default_capacity));
                rooms.insert(room.to_string(), group.clone());
                log::debug!("Room '{room}' created");
                group
            }
        };

        let peers = group.peer_count().await;
        if peers >= max_peers {
            if peers == 0 {
                rooms.remove(room);
            }
            return None;
        }
        let rx = group.add_peer(info).await;
        Some((group, rx))
    }

    /// Remove a peer and retire its room once empty, under one lock.
    pub async fn leave(&self, room: &str, peer_id: &Uuid) -> Option<PeerInfo> {
        let mut rooms = self.rooms.write().await;
        let group = rooms.get(room)?.clone();
        let info = group.remove_peer(peer_id).await;
        if group.peer_count().await == 0 {
            rooms.remove(room);
            log::debug!("Room '{room}' removed (empty)");
        }
        info
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
