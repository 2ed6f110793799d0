//! Undo/redo scopes over locally originated transactions.
//!
//! A scope is a [`yrs::UndoManager`] watching some of the store's root
//! maps. Only transactions whose origin is tracked become stack items, so
//! remote edits never enter the stacks.
//!
//! ```text
//!   E1 local      E2 remote      E3 local
//!   ─────┬────────────┬─────────────┬─────►
//!        │            │             │
//!   undo stack: [E1, E3]      (E2 never enters)
//!   undo() → reverts E3, undo() → reverts E1
//! ```
//!
//! Reverting removes what the step inserted and restores what it replaced,
//! unless a peer has written the same key since; such keys are left alone.

use crate::event::Origin;
use crate::store::{Container, ReplicatedStore, LOCAL_ORIGIN, REMOTE_ORIGIN};
use std::time::Duration;
use yrs::undo::Options;
use yrs::{MapRef, UndoManager};

#[derive(Debug, Clone, PartialEq)]
pub struct UndoScopeOptions {
    /// Containers whose changes are captured.
    pub containers: Vec<Container>,
    /// Transaction origins that produce stack items.
    pub tracked_origins: Vec<Origin>,
    /// Consecutive tracked transactions closer than this merge into one
    /// step. Zero keeps every transaction separate.
    pub capture_timeout: Duration,
}

impl Default for UndoScopeOptions {
    fn default() -> Self {
        Self {
            containers: vec![Container::Cells, Container::Meta],
            tracked_origins: vec![Origin::Local],
            capture_timeout: Duration::ZERO,
        }
    }
}

impl UndoScopeOptions {
    pub fn cells_only() -> Self {
        Self {
            containers: vec![Container::Cells],
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UndoScopeId(pub(crate) u32);

pub(crate) struct UndoScope {
    manager: UndoManager,
    options: UndoScopeOptions,
}

impl UndoScope {
    pub fn new(store: &ReplicatedStore, options: UndoScopeOptions) -> Self {
        Self {
            manager: manager(store, &options),
            options,
        }
    }

    /// Runs one undo transaction. The caller refreshes the store.
    pub fn undo(&mut self) -> bool {
        self.manager.undo_blocking()
    }

    pub fn redo(&mut self) -> bool {
        self.manager.redo_blocking()
    }

    pub fn can_undo(&self) -> bool {
        self.manager.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.manager.can_redo()
    }

    /// Drops both stacks.
    pub fn clear(&mut self, store: &ReplicatedStore) {
        self.manager = manager(store, &self.options);
    }
}

fn manager(store: &ReplicatedStore, options: &UndoScopeOptions) -> UndoManager {
    let mut maps: Vec<&MapRef> = options
        .containers
        .iter()
        .flat_map(|c| store.maps(*c))
        .collect();
    if maps.is_empty() {
        log::debug!("undo scope without containers, watching cells");
        maps = store.maps(Container::Cells);
    }

    let yrs_options = Options {
        capture_timeout_millis: options.capture_timeout.as_millis() as u64,
        ..Options::default()
    };
    let mut manager = UndoManager::with_scope_and_options(store.doc(), maps[0], yrs_options);
    for map in &maps[1..] {
        manager.expand_scope(*map);
    }
    for origin in &options.tracked_origins {
        match origin {
            Origin::Local => {
                manager.include_origin(LOCAL_ORIGIN);
            }
            Origin::Remote(_) => {
                manager.include_origin(REMOTE_ORIGIN);
            }
            Origin::History => log::debug!("history steps are tracked by the scope making them"),
        }
    }
    manager
}
