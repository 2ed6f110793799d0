//! Fan-out of relay frames to every connection in a room.
//!
//! One tokio broadcast channel per room. Every connection holds its own
//! receiver that buffers up to `capacity` frames; a receiver that falls
//! further behind sees `Lagged` and is resynchronised by the server.
//! Frames carry the sending connection id so receivers skip their own.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Identifies one accepted connection within the server.
pub type ConnId = u64;

/// A pre-encoded envelope plus the connection it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayFrame {
    pub sender: ConnId,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Counters touched on the hot path without taking the peer lock.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// A connected peer and the presence users it announced.
#[derive(Debug, Clone, Default)]
struct PeerEntry {
    users: BTreeSet<String>,
}

pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RelayFrame>>,
    peers: RwLock<HashMap<ConnId, PeerEntry>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            atomic_stats: AtomicBroadcastStats::default(),
        }
    }

    /// Registers a connection and returns its receiver.
    pub async fn add_peer(&self, conn: ConnId) -> broadcast::Receiver<Arc<RelayFrame>> {
        self.peers.write().await.insert(conn, PeerEntry::default());
        self.sender.subscribe()
    }

    /// Removes a connection, returning the presence users it announced.
    pub async fn remove_peer(&self, conn: ConnId) -> Vec<String> {
        self.peers
            .write()
            .await
            .remove(&conn)
            .map(|peer| peer.users.into_iter().collect())
            .unwrap_or_default()
    }

    /// Remembers that `users` are present through `conn`.
    pub async fn track_users(&self, conn: ConnId, users: &[String]) {
        if let Some(peer) = self.peers.write().await.get_mut(&conn) {
            peer.users.extend(users.iter().cloned());
        }
    }

    pub async fn untrack_users(&self, conn: ConnId, users: &[String]) {
        if let Some(peer) = self.peers.write().await.get_mut(&conn) {
            for user in users {
                peer.users.remove(user);
            }
        }
    }

    /// Sends to every receiver, the sender's own included; receivers
    /// filter on [`RelayFrame::sender`]. Returns the receiver count.
    pub fn broadcast(&self, sender: ConnId, text: String) -> usize {
        let count = self
            .sender
            .send(Arc::new(RelayFrame { sender, text }))
            .unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Records frames a lagging receiver never saw.
    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats
            .messages_dropped
            .fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, conn: ConnId) -> bool {
        self.peers.read().await.contains_key(&conn)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Rooms by name, each with the number of connections that joined it.
/// A room is dropped when its last member leaves; references handed out
/// by [`RoomManager::get`] or [`RoomManager::rooms`] do not keep it open.
pub struct RoomManager<R> {
    rooms: RwLock<HashMap<String, Entry<R>>>,
}

struct Entry<R> {
    room: Arc<R>,
    members: usize,
}

impl<R> Default for RoomManager<R> {
    fn default() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }
}

impl<R> RoomManager<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, name: &str) -> Option<Arc<R>> {
        self.rooms.read().await.get(name).map(|e| e.room.clone())
    }

    /// Returns the named room, building it with `make` on first use.
    /// Does not count as a member.
    pub async fn get_or_create(&self, name: &str, make: impl FnOnce() -> R) -> Arc<R> {
        if let Some(entry) = self.rooms.read().await.get(name) {
            return entry.room.clone();
        }

        let mut rooms = self.rooms.write().await;
        // Another connection may have created it meanwhile.
        rooms
            .entry(name.to_string())
            .or_insert_with(|| Entry {
                room: Arc::new(make()),
                members: 0,
            })
            .room
            .clone()
    }

    /// Like [`get_or_create`](Self::get_or_create), and registers one member.
    pub async fn join(&self, name: &str, make: impl FnOnce() -> R) -> Arc<R> {
        let mut rooms = self.rooms.write().await;
        let entry = rooms.entry(name.to_string()).or_insert_with(|| Entry {
            room: Arc::new(make()),
            members: 0,
        });
        entry.members += 1;
        entry.room.clone()
    }

    /// Unregisters one member. Returns true when that was the last one and
    /// the room was dropped.
    pub async fn leave(&self, name: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(entry) = rooms.get_mut(name) else {
            return false;
        };
        entry.members = entry.members.saturating_sub(1);
        if entry.members > 0 {
            return false;
        }
        rooms.remove(name);
        true
    }

    pub async fn members(&self, name: &str) -> usize {
        self.rooms.read().await.get(name).map_or(0, |e| e.members)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Every room, sorted by name.
    pub async fn rooms(&self) -> Vec<(String, Arc<R>)> {
        let mut rooms: Vec<(String, Arc<R>)> = self
            .rooms
            .read()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), entry.room.clone()))
            .collect();
        rooms.sort_by(|a, b| a.0.cmp(&b.0));
        rooms
    }
}
