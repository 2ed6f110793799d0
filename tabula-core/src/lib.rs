//! # tabula-core: Replicated spreadsheet document engine
//!
//! A conflict-free grid of cells that many replicas edit concurrently and
//! that converges regardless of delivery order, duplication or delay.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Document                                                 │
//! │  ┌───────────────┐   ┌────────────┐   ┌───────────────┐  │
//! │  │ReplicatedStore│   │PresenceRoom│   │ UndoScope(s)  │  │
//! │  │ (yrs::Doc)    │   │ (ephemeral)│   │ (UndoManager) │  │
//! │  └───────┬───────┘   └─────┬──────┘   └───────────────┘  │
//! │          │                 │                             │
//! │  ┌───────┴─────────────────┴──────┐                      │
//! │  │ EventDispatcher (DocEvent,     │──► on(), on_update() │
//! │  │                  UpdateEvent)  │                      │
//! │  └────────────────────────────────┘                      │
//! └──────────────────────────┬───────────────────────────────┘
//!                            │ codec (tag + yrs v1 / bincode)
//!                            ▼
//!                 updates / snapshots / state vectors
//! ```
//!
//! ## Modules
//!
//! - [`cell`]: cell keys, ranges, records and patches
//! - [`replica`]: replica identity
//! - [`store`]: cell fields and metadata on a `yrs::Doc`
//! - [`codec`]: binary update, snapshot and state-vector formats
//! - [`event`]: domain events, origins and subscriptions
//! - [`presence`]: awareness channel
//! - [`undo`]: undo/redo scopes
//! - [`document`]: the public entry point
//!
//! No I/O happens here; `tabula-collab` moves the bytes.

pub mod cell;
pub mod codec;
pub mod document;
pub mod error;
pub mod event;
pub mod presence;
pub mod replica;
pub mod store;
pub mod undo;

pub use cell::{CellFormat, CellKey, CellPatch, CellRange, CellRecord, CellRef, Scalar};
pub use document::{Document, DocumentOptions, RangeCell};
pub use error::{DocError, DocResult};
pub use event::{
    CellChange, DocEvent, MetaChange, Origin, Subscription, UpdateEvent, UpdateKind,
};
pub use presence::{PresencePatch, PresenceState};
pub use replica::ReplicaId;
pub use store::Container;
pub use undo::{UndoScopeId, UndoScopeOptions};
pub use yrs::StateVector;
