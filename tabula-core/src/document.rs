//! The replicated spreadsheet document.
//!
//! ```text
//! set_cell / set_cells / delete_cell / set_meta
//!        │
//!        ▼
//!  commit(writes)  ── one yrs transaction, origin "local"
//!        │
//!        ├──► ReplicatedStore::write  (root maps + cache refresh)
//!        ├──► DocEvent::CellsChanged  (one per transaction)
//!        └──► UpdateEvent             (encoded delta for the provider)
//!
//! apply_update(bytes) ── decode ─► yrs apply, origin "remote", same events
//! undo(scope)         ── UndoManager ─► same events, Origin::History
//! ```

use crate::cell::{CellKey, CellPatch, CellRange, CellRecord, CellRef, Scalar};
use crate::codec::{self, Format};
use crate::error::DocResult;
use crate::event::{
    presence_event, selection_event, CellChange, DocEvent, EventDispatcher, MetaChange, Origin,
    Subscription, UpdateEvent, UpdateKind,
};
use crate::presence::{PresencePatch, PresenceRoom, PresenceState};
use crate::replica::ReplicaId;
use crate::store::{Changes, Field, ReplicatedStore, Slot, SlotValue};
use crate::undo::{UndoScope, UndoScopeId, UndoScopeOptions};
use std::collections::HashMap;
use std::time::Duration;
use yrs::StateVector;

#[derive(Debug, Clone)]
pub struct DocumentOptions {
    pub replica_id: ReplicaId,
    /// Presence identity of this session.
    pub user_id: String,
    pub display_name: String,
}

impl Default for DocumentOptions {
    fn default() -> Self {
        let replica_id = ReplicaId::random();
        Self {
            replica_id,
            user_id: replica_id.to_string(),
            display_name: "Anonymous".to_string(),
        }
    }
}

impl DocumentOptions {
    pub fn for_user(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            ..Self::default()
        }
    }
}

/// One coordinate of a range read; `record` is `None` for empty cells.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeCell {
    pub row: u32,
    pub col: u32,
    pub record: Option<CellRecord>,
}

pub struct Document {
    replica_id: ReplicaId,
    store: ReplicatedStore,
    presence: PresenceRoom,
    events: EventDispatcher<DocEvent>,
    updates: EventDispatcher<UpdateEvent>,
    scopes: Vec<(UndoScopeId, UndoScope)>,
    next_scope: u32,
    destroyed: bool,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("replica", &self.replica_id)
            .field("cells", &self.store.cell_count())
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

impl Document {
    pub fn new() -> Self {
        Self::with_options(DocumentOptions::default())
    }

    pub fn with_options(options: DocumentOptions) -> Self {
        Self {
            replica_id: options.replica_id,
            store: ReplicatedStore::new(),
            presence: PresenceRoom::new(options.user_id, options.display_name),
            events: EventDispatcher::new(),
            updates: EventDispatcher::new(),
            scopes: Vec::new(),
            next_scope: 0,
            destroyed: false,
        }
    }

    pub fn with_replica(replica_id: ReplicaId) -> Self {
        Self::with_options(DocumentOptions {
            replica_id,
            user_id: replica_id.to_string(),
            ..DocumentOptions::default()
        })
    }

    /// Hydrates a document from a persisted snapshot (or any update).
    pub fn from_snapshot(bytes: &[u8], options: DocumentOptions) -> DocResult<Self> {
        let mut doc = Self::with_options(options);
        doc.apply_update(bytes)?;
        Ok(doc)
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    pub fn user_id(&self) -> &str {
        self.presence.local_user_id()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    // ── Cells ─────────────────────────────────────────────────────

    pub fn get_cell(&self, row: u32, col: u32) -> Option<CellRecord> {
        self.store.record(CellKey::new(row, col))
    }

    pub fn set_cell(&mut self, row: u32, col: u32, patch: CellPatch) {
        let writes = patch_writes(CellKey::new(row, col), patch);
        self.commit(writes);
    }

    /// Applies all patches as one transaction and one event.
    pub fn set_cells<I>(&mut self, patches: I)
    where
        I: IntoIterator<Item = (u32, u32, CellPatch)>,
    {
        let writes = patches
            .into_iter()
            .flat_map(|(row, col, patch)| patch_writes(CellKey::new(row, col), patch))
            .collect();
        self.commit(writes);
    }

    /// Clears every field. A concurrent write to one field brings back
    /// only that field.
    pub fn delete_cell(&mut self, row: u32, col: u32) {
        let key = CellKey::new(row, col);
        if !self.store.contains(key) {
            return;
        }
        let writes = Field::ALL
            .into_iter()
            .map(|field| (Slot::cell(key, field), None))
            .collect();
        self.commit(writes);
    }

    /// Every non-empty cell in row-major order.
    pub fn all_cells(&self) -> Vec<(CellRef, CellRecord)> {
        self.store
            .records()
            .map(|(key, record)| (CellRef::from(key), record.clone()))
            .collect()
    }

    /// Every coordinate of the (normalised) range, row-major, with `None`
    /// for empty cells. Placeholders are produced as the iterator is
    /// consumed, so bound it (`take`, `find`) for very large ranges.
    pub fn cells_in_range(
        &self,
        r0: u32,
        c0: u32,
        r1: u32,
        c1: u32,
    ) -> impl Iterator<Item = RangeCell> + '_ {
        CellRange::new(r0, c0, r1, c1)
            .iter()
            .map(move |cell| RangeCell {
                row: cell.row,
                col: cell.col,
                record: self.store.record(cell.key()),
            })
    }

    // ── Metadata ──────────────────────────────────────────────────

    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<Scalar>) {
        let writes = vec![(Slot::Meta(key.into()), Some(SlotValue::Scalar(value.into())))];
        self.commit(writes);
    }

    pub fn get_meta(&self, key: &str) -> Option<Scalar> {
        self.store.meta(key).cloned()
    }

    pub fn delete_meta(&mut self, key: &str) {
        if self.store.meta(key).is_none() {
            return;
        }
        self.commit(vec![(Slot::Meta(key.to_string()), None)]);
    }

    // ── Codec ─────────────────────────────────────────────────────

    /// Full-state snapshot.
    pub fn encode_state(&self) -> Vec<u8> {
        codec::frame(Format::Snapshot, &self.store.encode_state())
    }

    pub fn encode_state_vector(&self) -> Vec<u8> {
        codec::frame(Format::StateVector, &self.store.encode_state_vector())
    }

    /// What this replica has integrated, per yrs client.
    pub fn state_vector(&self) -> StateVector {
        self.store.state_vector()
    }

    /// Minimal update for a peer whose state vector is `state_vector`.
    /// Empty input yields everything.
    pub fn encode_diff(&self, state_vector: &[u8]) -> DocResult<Vec<u8>> {
        let sv = codec::decode_state_vector(state_vector)?;
        Ok(codec::frame(Format::Update, &self.store.encode_diff(&sv)))
    }

    /// Merges an update or snapshot from an unnamed peer. Returns whether
    /// anything new was integrated.
    pub fn apply_update(&mut self, bytes: &[u8]) -> DocResult<bool> {
        self.apply_update_from(bytes, Origin::Remote(ReplicaId::NIL))
    }

    pub fn apply_update_from(&mut self, bytes: &[u8], origin: Origin) -> DocResult<bool> {
        if self.destroyed {
            log::warn!("apply_update on destroyed document ignored");
            return Ok(false);
        }
        let update = codec::decode_update(bytes)?;
        let (learned, changes) = self.store.apply(update)?;
        if !learned {
            log::trace!("update already integrated, nothing to do");
            return Ok(false);
        }
        log::trace!(
            "applied update from {:?}: {} cell(s), {} meta key(s) changed",
            origin,
            changes.cells.len(),
            changes.meta.len()
        );
        self.finish_transaction(origin, changes, Some(bytes.to_vec()));
        Ok(true)
    }

    // ── Listeners ─────────────────────────────────────────────────

    /// Registers a domain-event listener.
    pub fn on(&mut self, listener: impl FnMut(&DocEvent) + Send + 'static) -> Subscription {
        self.events.subscribe(listener)
    }

    /// Registers a listener for encoded document and awareness updates.
    pub fn on_update(&mut self, listener: impl FnMut(&UpdateEvent) + Send + 'static) -> Subscription {
        self.updates.subscribe(listener)
    }

    // ── Presence ──────────────────────────────────────────────────

    pub fn set_local_presence(&mut self, patch: PresencePatch) {
        if self.destroyed {
            log::warn!("set_local_presence on destroyed document ignored");
            return;
        }
        let moved = self.presence.set_local(patch);
        if moved {
            let event = selection_event(self.presence.local(), Origin::Local);
            self.events.emit(&event);
        }
        let update = UpdateEvent {
            kind: UpdateKind::Awareness,
            origin: Origin::Local,
            update: self.presence.encode_local(),
        };
        self.updates.emit(&update);
    }

    /// Remote sessions only.
    pub fn get_presence(&self) -> Vec<PresenceState> {
        self.presence.peers()
    }

    pub fn local_presence(&self) -> &PresenceState {
        self.presence.local()
    }

    /// Local entry, if one was ever set.
    pub fn encode_local_awareness(&self) -> Option<Vec<u8>> {
        self.presence.has_local().then(|| self.presence.encode_local())
    }

    /// Every known presence state, for briefing a newcomer.
    pub fn encode_awareness(&self) -> Vec<u8> {
        self.presence.encode_all()
    }

    /// Merges remote presence and returns the user ids that arrived or
    /// changed.
    pub fn apply_awareness_update(&mut self, bytes: &[u8]) -> DocResult<Vec<String>> {
        if self.destroyed {
            return Ok(Vec::new());
        }
        let delta = self.presence.apply(bytes)?;
        if delta.is_empty() {
            return Ok(Vec::new());
        }
        let origin = Origin::Remote(ReplicaId::NIL);
        let touched = delta.touched();
        self.events.emit(&presence_event(
            delta.added,
            delta.updated,
            Vec::new(),
            origin,
        ));
        for state in &delta.selections {
            self.events.emit(&selection_event(state, origin));
        }
        self.updates.emit(&UpdateEvent {
            kind: UpdateKind::Awareness,
            origin,
            update: bytes.to_vec(),
        });
        Ok(touched)
    }

    pub fn remove_presence(&mut self, user_ids: &[String]) -> Vec<String> {
        let removed = self.presence.remove(user_ids);
        self.emit_removed(&removed);
        removed
    }

    pub fn clear_remote_presence(&mut self) -> Vec<String> {
        let removed = self.presence.clear_remote();
        self.emit_removed(&removed);
        removed
    }

    pub fn prune_idle_presence(&mut self, timeout: Duration) -> Vec<String> {
        let removed = self.presence.prune_idle(timeout);
        self.emit_removed(&removed);
        removed
    }

    fn emit_removed(&mut self, removed: &[String]) {
        if removed.is_empty() || self.destroyed {
            return;
        }
        self.events.emit(&presence_event(
            Vec::new(),
            Vec::new(),
            removed.to_vec(),
            Origin::Remote(ReplicaId::NIL),
        ));
    }

    // ── Undo ──────────────────────────────────────────────────────

    pub fn create_undo_scope(&mut self, options: UndoScopeOptions) -> UndoScopeId {
        let id = UndoScopeId(self.next_scope);
        self.next_scope += 1;
        self.scopes.push((id, UndoScope::new(&self.store, options)));
        id
    }

    fn scope(&self, id: UndoScopeId) -> Option<&UndoScope> {
        self.scopes.iter().find(|(sid, _)| *sid == id).map(|(_, s)| s)
    }

    /// Reverts the most recent tracked step that still has an effect.
    /// Returns false when nothing was reverted.
    pub fn undo(&mut self, scope: UndoScopeId) -> bool {
        self.step(scope, true)
    }

    pub fn redo(&mut self, scope: UndoScopeId) -> bool {
        self.step(scope, false)
    }

    fn step(&mut self, id: UndoScopeId, undo: bool) -> bool {
        if self.destroyed {
            return false;
        }
        let before = self.store.state_vector();
        let done = match self.scopes.iter_mut().find(|(sid, _)| *sid == id) {
            Some((_, scope)) if undo => scope.undo(),
            Some((_, scope)) => scope.redo(),
            None => return false,
        };
        if !done {
            return false;
        }
        let changes = self.store.refresh();
        let update = codec::frame(Format::Update, &self.store.encode_diff(&before));
        self.finish_transaction(Origin::History, changes, Some(update));
        true
    }

    pub fn can_undo(&self, scope: UndoScopeId) -> bool {
        self.scope(scope).is_some_and(UndoScope::can_undo)
    }

    pub fn can_redo(&self, scope: UndoScopeId) -> bool {
        self.scope(scope).is_some_and(UndoScope::can_redo)
    }

    pub fn clear_undo_scope(&mut self, id: UndoScopeId) {
        if let Some((_, scope)) = self.scopes.iter_mut().find(|(sid, _)| *sid == id) {
            scope.clear(&self.store);
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    /// Detaches every listener and undo scope. Later mutations are
    /// ignored; reads keep working.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.events.clear();
        self.updates.clear();
        self.scopes.clear();
        self.presence.clear_remote();
        self.destroyed = true;
        log::debug!("document {} destroyed", self.replica_id);
    }

    // ── Transactions ──────────────────────────────────────────────

    fn commit(&mut self, writes: Vec<(Slot, Option<SlotValue>)>) {
        if self.destroyed {
            log::warn!("mutation on destroyed document ignored");
            return;
        }
        let writes = dedupe(writes);
        if writes.is_empty() {
            return;
        }
        let (update, changes) = match self.store.write(&writes) {
            Ok(done) => done,
            Err(e) => {
                log::error!("local transaction failed: {}", e);
                return;
            }
        };
        if changes.is_empty() {
            log::trace!("transaction changed nothing");
            return;
        }
        let update = codec::frame(Format::Update, &update);
        self.finish_transaction(Origin::Local, changes, Some(update));
    }

    fn finish_transaction(&mut self, origin: Origin, changes: Changes, update: Option<Vec<u8>>) {
        if !changes.is_empty() {
            let cells = changes
                .cells
                .into_iter()
                .map(|(key, record)| CellChange {
                    row: key.row(),
                    col: key.col(),
                    record,
                })
                .collect();
            let meta = changes
                .meta
                .into_iter()
                .map(|(key, value)| MetaChange { key, value })
                .collect();
            self.events.emit(&DocEvent::CellsChanged {
                origin,
                cells,
                meta,
            });
        }

        if let Some(update) = update {
            self.updates.emit(&UpdateEvent {
                kind: UpdateKind::Document,
                origin,
                update,
            });
        }
    }
}

fn patch_writes(key: CellKey, patch: CellPatch) -> Vec<(Slot, Option<SlotValue>)> {
    let mut writes = Vec::with_capacity(3);
    if let Some(value) = patch.value {
        writes.push((Slot::cell(key, Field::Value), Some(SlotValue::Scalar(value))));
    }
    if let Some(formula) = patch.formula {
        writes.push((Slot::cell(key, Field::Formula), formula.map(SlotValue::Text)));
    }
    if let Some(format) = patch.format {
        writes.push((Slot::cell(key, Field::Format), format.map(SlotValue::Format)));
    }
    writes
}

/// Last write per slot wins inside one transaction; first-seen order kept.
fn dedupe(writes: Vec<(Slot, Option<SlotValue>)>) -> Vec<(Slot, Option<SlotValue>)> {
    let mut position: HashMap<Slot, usize> = HashMap::new();
    let mut out: Vec<(Slot, Option<SlotValue>)> = Vec::with_capacity(writes.len());
    for (slot, value) in writes {
        match position.get(&slot) {
            Some(&i) => out[i].1 = value,
            None => {
                position.insert(slot.clone(), out.len());
                out.push((slot, value));
            }
        }
    }
    out
}
