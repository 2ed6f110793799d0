//! Domain events and the per-document listener registry.
//!
//! Listeners are called synchronously, in registration order, once per
//! transaction. A listener that panics is logged and skipped; the others
//! still see the event.

use crate::cell::{CellRange, CellRecord, CellRef, Scalar};
use crate::replica::ReplicaId;
use crate::presence::PresenceState;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Who produced a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// A call on this document's API.
    Local,
    /// An update received from another replica.
    Remote(ReplicaId),
    /// An undo or redo step.
    History,
}

impl Origin {
    pub fn is_remote(&self) -> bool {
        matches!(self, Origin::Remote(_))
    }
}

/// New state of one cell after a transaction; `None` means it was deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct CellChange {
    pub row: u32,
    pub col: u32,
    pub record: Option<CellRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetaChange {
    pub key: String,
    pub value: Option<Scalar>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DocEvent {
    /// One per transaction touching cells or metadata.
    CellsChanged {
        origin: Origin,
        cells: Vec<CellChange>,
        meta: Vec<MetaChange>,
    },
    SelectionChanged {
        user_id: String,
        cursor: Option<CellRef>,
        selection: Option<CellRange>,
        origin: Origin,
    },
    PresenceUpdated {
        added: Vec<String>,
        updated: Vec<String>,
        removed: Vec<String>,
        origin: Origin,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Document,
    Awareness,
}

/// Encoded bytes of a transaction or an awareness change, ready to ship.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEvent {
    pub kind: UpdateKind,
    pub origin: Origin,
    pub update: Vec<u8>,
}

/// Handle returned by every `on*` registration. Dropping it (or calling
/// [`Subscription::dispose`]) detaches the listener.
#[must_use = "dropping a Subscription detaches the listener"]
#[derive(Debug)]
pub struct Subscription {
    active: Arc<AtomicBool>,
}

impl Subscription {
    pub fn dispose(self) {}

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Keeps the listener attached for the document's lifetime.
    pub fn detach(self) {
        std::mem::forget(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

type Listener<E> = Box<dyn FnMut(&E) + Send>;

struct Slot<E> {
    active: Arc<AtomicBool>,
    listener: Listener<E>,
}

pub struct EventDispatcher<E> {
    listeners: Vec<Slot<E>>,
}

impl<E> Default for EventDispatcher<E> {
    fn default() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }
}

impl<E> EventDispatcher<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, listener: impl FnMut(&E) + Send + 'static) -> Subscription {
        let active = Arc::new(AtomicBool::new(true));
        self.listeners.push(Slot {
            active: active.clone(),
            listener: Box::new(listener),
        });
        Subscription { active }
    }

    pub fn emit(&mut self, event: &E) {
        self.listeners.retain(|s| s.active.load(Ordering::Acquire));
        for (i, slot) in self.listeners.iter_mut().enumerate() {
            if !slot.active.load(Ordering::Acquire) {
                continue;
            }
            let listener = &mut slot.listener;
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                log::error!("listener #{} panicked; event delivered to the rest", i);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.listeners
            .iter()
            .filter(|s| s.active.load(Ordering::Acquire))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        for slot in &self.listeners {
            slot.active.store(false, Ordering::Release);
        }
        self.listeners.clear();
    }
}

impl<E> std::fmt::Debug for EventDispatcher<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("listeners", &self.len())
            .finish()
    }
}

/// Convenience used by presence events.
pub(crate) fn presence_event(
    added: Vec<String>,
    updated: Vec<String>,
    removed: Vec<String>,
    origin: Origin,
) -> DocEvent {
    DocEvent::PresenceUpdated {
        added,
        updated,
        removed,
        origin,
    }
}

pub(crate) fn selection_event(state: &PresenceState, origin: Origin) -> DocEvent {
    DocEvent::SelectionChanged {
        user_id: state.user_id.clone(),
        cursor: state.cursor,
        selection: state.selection,
        origin,
    }
}
