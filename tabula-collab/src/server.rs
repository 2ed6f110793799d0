//! WebSocket relay with one authoritative document per room.
//!
//! Architecture:
//! ```text
//! Client A ──┐   ws://host/<room>?token=..
//!             ├── Room ── Document (authority) ── BroadcastGroup
//! Client B ──┘              │                         │
//!                           ├── SnapshotStore         ├──► Client A
//!                           │   (interval, on close)  └──► Client B
//!                           └── presence users per connection
//! ```
//!
//! Each room answers handshakes as the responder, applies every update and
//! awareness change to its own document, and fans the original frame out
//! to the other connections. Nothing is ever echoed to its sender. When a
//! connection goes away the presence users it announced are removed and a
//! `presence-leave` goes to the rest of the room.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tabula_core::{Document, DocumentOptions, Origin, ReplicaId};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::auth::{room_from_path, token_from_query, AllowAll, Authorizer};
use crate::broadcast::{BroadcastGroup, ConnId, RoomManager};
use crate::persistence::{FileStore, SnapshotStore, StoreError};
use crate::protocol::{Effect, Envelope, SyncError, SyncProtocol};
use crate::transport::{websocket_connection, Connection, FrameSink, TransportError};

const RELAY_USER: &str = "tabula-relay";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("storage: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Frames buffered per connection before it counts as lagging
    pub broadcast_capacity: usize,
    /// How often dirty rooms are snapshotted (None = only on close)
    pub snapshot_interval: Option<Duration>,
    /// Snapshot directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            snapshot_interval: Some(Duration::from_secs(30)),
            storage_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub active_rooms: usize,
    pub persisted_snapshots: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    total_messages: AtomicU64,
    persisted_snapshots: AtomicU64,
}

/// Authoritative document plus fan-out for one room.
struct Room {
    doc: Mutex<Document>,
    group: BroadcastGroup,
    /// Changed since the last snapshot.
    dirty: AtomicBool,
}

impl Room {
    fn new(doc: Document, capacity: usize) -> Self {
        Self {
            doc: Mutex::new(doc),
            group: BroadcastGroup::new(capacity),
            dirty: AtomicBool::new(false),
        }
    }

    fn doc(&self) -> MutexGuard<'_, Document> {
        self.doc.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn relay_options() -> DocumentOptions {
    DocumentOptions::for_user(RELAY_USER, RELAY_USER)
}

/// The relay server. Cheap to clone; clones share rooms and storage.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    rooms: Arc<RoomManager<Room>>,
    store: Option<Arc<dyn SnapshotStore>>,
    authorizer: Arc<dyn Authorizer>,
    next_conn: Arc<AtomicU64>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Opens the snapshot directory if `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store = match &config.storage_path {
            Some(path) => Some(Arc::new(FileStore::open(path)?) as Arc<dyn SnapshotStore>),
            None => None,
        };
        Ok(Self {
            config,
            rooms: Arc::new(RoomManager::new()),
            store,
            authorizer: Arc::new(AllowAll),
            next_conn: Arc::new(AtomicU64::new(1)),
            stats: Arc::new(AtomicServerStats::default()),
        })
    }

    /// In-memory server with default configuration.
    pub fn with_defaults() -> Self {
        Self {
            config: ServerConfig::default(),
            rooms: Arc::new(RoomManager::new()),
            store: None,
            authorizer: Arc::new(AllowAll),
            next_conn: Arc::new(AtomicU64::new(1)),
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Loads every stored room so it is ready before anyone joins.
    pub async fn recover(&self) -> Result<usize, ServerError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let names = store.rooms()?;
        for name in &names {
            self.rooms.get_or_create(name, || self.load_room(name)).await;
        }
        log::info!("Recovered {} room(s) from storage", names.len());
        Ok(names.len())
    }

    /// Binds `bind_addr` and serves until the listener fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.recover().await?;
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        if let Some(interval) = self.config.snapshot_interval {
            self.spawn_persister(interval);
        }

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle_tcp(stream, addr).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_tcp(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), ServerError> {
        let mut room_name = None;
        let mut refused = false;
        let callback = |request: &Request, response: Response| {
            let room = room_from_path(request.uri().path());
            let token = token_from_query(request.uri().query());
            if !self.authorizer.authorize(&room, token.as_deref()) {
                refused = true;
                let mut refusal = ErrorResponse::new(Some("forbidden".to_string()));
                *refusal.status_mut() = StatusCode::FORBIDDEN;
                return Err(refusal);
            }
            room_name = Some(room);
            Ok(response)
        };
        let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                if refused {
                    self.stats.rejected_connections.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Refused connection from {addr}");
                }
                return Err(e.into());
            }
        };
        let room_name = room_name.unwrap_or_else(|| room_from_path("/"));
        log::info!("WebSocket connection from {addr} to room '{room_name}'");
        self.serve(&room_name, websocket_connection(ws)).await?;
        Ok(())
    }

    /// Runs one already-admitted connection inside `room_name` until it
    /// closes. Also the entry point for in-memory connections.
    pub async fn serve(&self, room_name: &str, conn: Connection) -> Result<(), TransportError> {
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let room = self
            .rooms
            .join(room_name, || self.load_room(room_name))
            .await;
        let mut rx = room.group.add_peer(conn_id).await;
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        self.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::debug!("Connection {conn_id} joined room '{room_name}'");

        let result = self.session(&room, conn_id, conn, &mut rx).await;
        drop(rx);

        // ── cleanup ──
        self.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        let users = room.group.remove_peer(conn_id).await;
        if !users.is_empty() {
            room.doc().remove_presence(&users);
            log::debug!("Connection {conn_id} left with {} presence user(s)", users.len());
            self.relay(&room, conn_id, &Envelope::PresenceLeave { user_ids: users });
        }
        if room.group.peer_count().await == 0 {
            self.persist(room_name, &room);
        }
        if self.rooms.leave(room_name).await {
            log::info!("Room '{room_name}' closed");
        }
        result
    }

    async fn session(
        &self,
        room: &Room,
        conn_id: ConnId,
        conn: Connection,
        rx: &mut tokio::sync::broadcast::Receiver<Arc<crate::broadcast::RelayFrame>>,
    ) -> Result<(), TransportError> {
        let Connection {
            mut sink,
            mut stream,
        } = conn;
        let mut protocol = SyncProtocol::responder();

        loop {
            tokio::select! {
                frame = stream.next() => {
                    let text = match frame {
                        Some(Ok(text)) => text,
                        Some(Err(e)) => return Err(e),
                        None => return Ok(()),
                    };
                    self.stats.total_messages.fetch_add(1, Ordering::Relaxed);
                    let replies = self.receive(room, conn_id, &mut protocol, &text).await;
                    send_all(&mut sink, replies).await?;
                }
                frame = rx.recv() => match frame {
                    Ok(frame) => {
                        if frame.sender != conn_id {
                            sink.send(frame.text.clone()).await?;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!("Connection {conn_id} lagged by {missed} frame(s), resending state");
                        room.group.record_dropped(missed);
                        let catch_up = {
                            let doc = room.doc();
                            vec![
                                Envelope::Update { update: doc.encode_state() },
                                Envelope::Awareness { update: doc.encode_awareness() },
                            ]
                        };
                        send_all(&mut sink, catch_up).await?;
                    }
                    Err(RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    async fn receive(
        &self,
        room: &Room,
        conn_id: ConnId,
        protocol: &mut SyncProtocol,
        text: &str,
    ) -> Vec<Envelope> {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("Dropping frame from connection {conn_id}: {e}");
                return Vec::new();
            }
        };
        let kind = envelope.kind();
        let opening = matches!(envelope, Envelope::SyncStep1 { .. });

        let result = {
            let mut doc = room.doc();
            protocol
                .handle(&mut doc, envelope, Origin::Remote(ReplicaId::NIL))
                .map(|mut outcome| {
                    // Brief a newcomer on who is already here.
                    if opening && !doc.get_presence().is_empty() {
                        outcome.replies.push(Envelope::Awareness {
                            update: doc.encode_awareness(),
                        });
                    }
                    outcome
                })
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(SyncError::Protocol(e)) => {
                log::warn!("Dropping {kind} from connection {conn_id}: {e}");
                return Vec::new();
            }
            Err(SyncError::Merge(e)) => {
                log::error!("Rejected {kind} from connection {conn_id}: {e}");
                return Vec::new();
            }
        };

        match outcome.effect {
            Effect::Nothing => {}
            Effect::Document(update) => {
                room.dirty.store(true, Ordering::Release);
                log::trace!("Relaying {} byte update from connection {conn_id}", update.len());
                self.relay(room, conn_id, &Envelope::Update { update });
            }
            Effect::Awareness { update, users } => {
                room.group.track_users(conn_id, &users).await;
                self.relay(room, conn_id, &Envelope::Awareness { update });
            }
            Effect::PresenceLeave(users) => {
                room.group.untrack_users(conn_id, &users).await;
                self.relay(room, conn_id, &Envelope::PresenceLeave { user_ids: users });
            }
        }
        outcome.replies
    }

    fn relay(&self, room: &Room, sender: ConnId, envelope: &Envelope) {
        match envelope.encode() {
            Ok(text) => {
                room.group.broadcast(sender, text);
            }
            Err(e) => log::error!("Failed to encode {}: {e}", envelope.kind()),
        }
    }

    fn load_room(&self, name: &str) -> Room {
        let capacity = self.config.broadcast_capacity;
        let Some(store) = &self.store else {
            return Room::new(Document::with_options(relay_options()), capacity);
        };
        let doc = match store.load(name) {
            Ok(Some(bytes)) => match Document::from_snapshot(&bytes, relay_options()) {
                Ok(doc) => {
                    log::info!("Loaded room '{name}' from storage ({} bytes)", bytes.len());
                    doc
                }
                Err(e) => {
                    log::error!("Stored snapshot of room '{name}' is unusable: {e}");
                    Document::with_options(relay_options())
                }
            },
            Ok(None) => Document::with_options(relay_options()),
            Err(e) => {
                log::error!("Failed to load room '{name}': {e}");
                Document::with_options(relay_options())
            }
        };
        Room::new(doc, capacity)
    }

    /// Saves the room if it changed since the last save.
    fn persist(&self, name: &str, room: &Room) {
        let Some(store) = &self.store else {
            return;
        };
        if !room.dirty.swap(false, Ordering::AcqRel) {
            return;
        }
        let snapshot = room.doc().encode_state();
        match store.save(name, &snapshot) {
            Ok(()) => {
                self.stats.persisted_snapshots.fetch_add(1, Ordering::Relaxed);
                log::debug!("Persisted room '{name}' ({} bytes)", snapshot.len());
            }
            Err(e) => {
                room.dirty.store(true, Ordering::Release);
                log::error!("Failed to persist room '{name}': {e}");
            }
        }
    }

    /// Snapshots every dirty room.
    pub async fn persist_all(&self) {
        for (name, room) in self.rooms.rooms().await {
            self.persist(&name, &room);
        }
    }

    fn spawn_persister(&self, interval: Duration) {
        let server = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                server.persist_all().await;
            }
        });
    }

    /// Full state of a live room.
    pub async fn room_state(&self, name: &str) -> Option<Vec<u8>> {
        let room = self.rooms.get(name).await?;
        let state = room.doc().encode_state();
        Some(state)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.room_count().await
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.stats.rejected_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            active_rooms: self.rooms.room_count().await,
            persisted_snapshots: self.stats.persisted_snapshots.load(Ordering::Relaxed),
        }
    }
}

async fn send_all(sink: &mut FrameSink, envelopes: Vec<Envelope>) -> Result<(), TransportError> {
    for envelope in envelopes {
        match envelope.encode() {
            Ok(text) => sink.send(text).await?,
            Err(e) => log::error!("Failed to encode {}: {e}", envelope.kind()),
        }
    }
    Ok(())
}
