//! # tabula-collab — network sync for Tabula documents
//!
//! Moves `tabula-core` updates and presence between replicas over
//! WebSocket text frames carrying a JSON envelope.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket       ┌──────────────┐
//! │ SyncProvider │ ◄─────────────────► │ SyncServer   │
//! │ (per session)│    JSON envelope    │ (relay)      │
//! └──────┬───────┘                     └──────┬───────┘
//!        │                                    │
//!        ▼                                    ▼
//! ┌──────────────┐                     ┌──────────────┐
//! │ Document     │                     │ Document     │
//! │ (local)      │                     │ (per room)   │
//! └──────────────┘                     └──────┬───────┘
//!                                             │
//!                                  ┌──────────┴─────────┐
//!                                  │ BroadcastGroup     │
//!                                  │ SnapshotStore      │
//!                                  └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — envelope, handshake state machine, sync status
//! - [`transport`] — WebSocket and in-memory connections
//! - [`provider`] — client actor with reconnect
//! - [`broadcast`] — per-room fan-out and room registry
//! - [`server`] — relay server
//! - [`persistence`] — snapshot stores
//! - [`auth`] — connection admission

pub mod auth;
pub mod broadcast;
pub mod persistence;
pub mod protocol;
pub mod provider;
pub mod server;
pub mod transport;

pub use auth::{AllowAll, Authorizer, TokenAuthorizer};
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomManager};
pub use persistence::{CompressedSnapshot, FileStore, MemoryStore, SnapshotStore, StoreError};
pub use protocol::{Effect, Envelope, Outcome, ProtocolError, SyncError, SyncProtocol, SyncStatus};
pub use provider::{lock, shared, ProviderConfig, SharedDoc, SyncProvider};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use transport::{
    pair, Connection, MemoryListener, MemoryTransport, Transport, TransportError,
    WebSocketTransport,
};
