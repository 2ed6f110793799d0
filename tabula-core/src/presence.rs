//! Ephemeral presence: who is here and where their cursor is.
//!
//! ```text
//! set_local_presence(patch)
//!       │  clock += 1
//!       ▼
//! encode [AwarenessEntry { clock, state }]  ──►  provider / relay
//!                                                    │
//! apply_awareness_update(bytes)  ◄───────────────────┘
//!       │  per user_id: higher clock wins, own id ignored
//!       ▼
//! PresenceUpdated / SelectionChanged events
//! ```
//!
//! Nothing here is part of the durable document. Entries carry no
//! tombstones; leaving peers are simply dropped.

use crate::cell::{CellRange, CellRef};
use crate::codec::{self, Format};
use crate::error::DocResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Presence of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    pub user_id: String,
    pub display_name: String,
    pub cursor: Option<CellRef>,
    pub selection: Option<CellRange>,
    /// Milliseconds since the Unix epoch of the owner's last change.
    pub last_seen: u64,
}

impl PresenceState {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            cursor: None,
            selection: None,
            last_seen: 0,
        }
    }
}

/// Partial update of the local presence entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PresencePatch {
    pub display_name: Option<String>,
    pub cursor: Option<Option<CellRef>>,
    pub selection: Option<Option<CellRange>>,
}

impl PresencePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_cursor(mut self, row: u32, col: u32) -> Self {
        self.cursor = Some(Some(CellRef::new(row, col)));
        self
    }

    pub fn clear_cursor(mut self) -> Self {
        self.cursor = Some(None);
        self
    }

    pub fn with_selection(mut self, range: CellRange) -> Self {
        self.selection = Some(Some(range));
        self
    }

    pub fn clear_selection(mut self) -> Self {
        self.selection = Some(None);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AwarenessEntry {
    clock: u64,
    state: PresenceState,
}

/// What an incoming awareness payload changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AwarenessDelta {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    /// States whose cursor or selection moved.
    pub selections: Vec<PresenceState>,
}

impl AwarenessDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Every user id that arrived or changed.
    pub fn touched(&self) -> Vec<String> {
        self.added.iter().chain(&self.updated).cloned().collect()
    }
}

#[derive(Debug, Clone)]
struct RemotePeer {
    clock: u64,
    state: PresenceState,
    received: Instant,
}

#[derive(Debug, Clone)]
pub struct PresenceRoom {
    local: PresenceState,
    local_clock: u64,
    peers: HashMap<String, RemotePeer>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl PresenceRoom {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            local: PresenceState::new(user_id, display_name),
            local_clock: 0,
            peers: HashMap::new(),
        }
    }

    pub fn local_user_id(&self) -> &str {
        &self.local.user_id
    }

    pub fn local(&self) -> &PresenceState {
        &self.local
    }

    /// True once the local entry has been published at least once.
    pub fn has_local(&self) -> bool {
        self.local_clock > 0
    }

    /// Applies the patch and returns whether cursor or selection moved.
    pub fn set_local(&mut self, patch: PresencePatch) -> bool {
        let before = (self.local.cursor, self.local.selection);
        if let Some(name) = patch.display_name {
            self.local.display_name = name;
        }
        if let Some(cursor) = patch.cursor {
            self.local.cursor = cursor;
        }
        if let Some(selection) = patch.selection {
            self.local.selection = selection;
        }
        self.local.last_seen = now_millis();
        self.local_clock += 1;
        before != (self.local.cursor, self.local.selection)
    }

    pub fn encode_local(&self) -> Vec<u8> {
        let entries = vec![AwarenessEntry {
            clock: self.local_clock,
            state: self.local.clone(),
        }];
        codec::encode(Format::Awareness, &entries)
    }

    /// Every known state, local included if it was ever set.
    pub fn encode_all(&self) -> Vec<u8> {
        let mut entries: Vec<AwarenessEntry> = self
            .peers
            .values()
            .map(|p| AwarenessEntry {
                clock: p.clock,
                state: p.state.clone(),
            })
            .collect();
        if self.has_local() {
            entries.push(AwarenessEntry {
                clock: self.local_clock,
                state: self.local.clone(),
            });
        }
        entries.sort_by(|a, b| a.state.user_id.cmp(&b.state.user_id));
        codec::encode(Format::Awareness, &entries)
    }

    pub fn apply(&mut self, bytes: &[u8]) -> DocResult<AwarenessDelta> {
        let entries: Vec<AwarenessEntry> = codec::decode(bytes, Format::Awareness)?;
        let mut delta = AwarenessDelta::default();
        let now = Instant::now();
        for entry in entries {
            let user_id = entry.state.user_id.clone();
            if user_id == self.local.user_id {
                continue;
            }
            match self.peers.get_mut(&user_id) {
                Some(peer) if peer.clock >= entry.clock => continue,
                Some(peer) => {
                    let moved = peer.state.cursor != entry.state.cursor
                        || peer.state.selection != entry.state.selection;
                    peer.clock = entry.clock;
                    peer.state = entry.state;
                    peer.received = now;
                    if moved {
                        delta.selections.push(peer.state.clone());
                    }
                    delta.updated.push(user_id);
                }
                None => {
                    if entry.state.cursor.is_some() || entry.state.selection.is_some() {
                        delta.selections.push(entry.state.clone());
                    }
                    self.peers.insert(
                        user_id.clone(),
                        RemotePeer {
                            clock: entry.clock,
                            state: entry.state,
                            received: now,
                        },
                    );
                    delta.added.push(user_id);
                }
            }
        }
        Ok(delta)
    }

    pub fn remove(&mut self, user_ids: &[String]) -> Vec<String> {
        user_ids
            .iter()
            .filter(|id| self.peers.remove(id.as_str()).is_some())
            .cloned()
            .collect()
    }

    pub fn clear_remote(&mut self) -> Vec<String> {
        let mut removed: Vec<String> = self.peers.drain().map(|(id, _)| id).collect();
        removed.sort();
        removed
    }

    /// Drops peers not heard from within `timeout`.
    pub fn prune_idle(&mut self, timeout: Duration) -> Vec<String> {
        let mut stale: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, p)| p.received.elapsed() > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        stale.sort();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    /// Remote peers, sorted by user id.
    pub fn peers(&self) -> Vec<PresenceState> {
        let mut states: Vec<PresenceState> = self.peers.values().map(|p| p.state.clone()).collect();
        states.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        states
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_excluded_until_set() {
        let mut alice = PresenceRoom::new("alice", "Alice");
        let mut bob = PresenceRoom::new("bob", "Bob");

        let delta = bob.apply(&alice.encode_all()).unwrap();
        assert!(delta.is_empty());

        alice.set_local(PresencePatch::new().with_cursor(2, 3));
        let delta = bob.apply(&alice.encode_all()).unwrap();
        assert_eq!(delta.added, vec!["alice".to_string()]);
        assert_eq!(delta.selections.len(), 1);
        assert_eq!(bob.peers()[0].cursor, Some(CellRef::new(2, 3)));
    }

    #[test]
    fn test_stale_clock_ignored() {
        let mut alice = PresenceRoom::new("alice", "Alice");
        let mut bob = PresenceRoom::new("bob", "Bob");

        alice.set_local(PresencePatch::new().with_cursor(0, 0));
        let old = alice.encode_local();
        alice.set_local(PresencePatch::new().with_cursor(5, 5));
        let new = alice.encode_local();

        bob.apply(&new).unwrap();
        let delta = bob.apply(&old).unwrap();
        assert!(delta.is_empty());
        assert_eq!(bob.peers()[0].cursor, Some(CellRef::new(5, 5)));
    }

    #[test]
    fn test_own_entry_ignored() {
        let mut alice = PresenceRoom::new("alice", "Alice");
        alice.set_local(PresencePatch::new().with_display_name("A"));
        let bytes = alice.encode_local();
        assert!(alice.apply(&bytes).unwrap().is_empty());
        assert_eq!(alice.peer_count(), 0);
    }

    #[test]
    fn test_name_change_is_update_without_selection() {
        let mut alice = PresenceRoom::new("alice", "Alice");
        let mut bob = PresenceRoom::new("bob", "Bob");
        alice.set_local(PresencePatch::new().with_cursor(1, 1));
        bob.apply(&alice.encode_local()).unwrap();

        let moved = alice.set_local(PresencePatch::new().with_display_name("Alice B."));
        assert!(!moved);
        let delta = bob.apply(&alice.encode_local()).unwrap();
        assert_eq!(delta.updated, vec!["alice".to_string()]);
        assert!(delta.selections.is_empty());
    }

    #[test]
    fn test_remove_and_prune() {
        let mut alice = PresenceRoom::new("alice", "Alice");
        let mut carol = PresenceRoom::new("carol", "Carol");
        let mut bob = PresenceRoom::new("bob", "Bob");
        alice.set_local(PresencePatch::new());
        carol.set_local(PresencePatch::new());
        bob.apply(&alice.encode_local()).unwrap();
        bob.apply(&carol.encode_local()).unwrap();

        let removed = bob.remove(&["alice".to_string(), "nobody".to_string()]);
        assert_eq!(removed, vec!["alice".to_string()]);
        assert!(bob.prune_idle(Duration::from_secs(60)).is_empty());

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(bob.prune_idle(Duration::from_millis(5)), vec!["carol".to_string()]);
        assert_eq!(bob.peer_count(), 0);
    }

    #[test]
    fn test_garbage_rejected() {
        let mut bob = PresenceRoom::new("bob", "Bob");
        assert!(bob.apply(&[0x04, 0xff, 0xff]).is_err());
        assert!(bob.apply(&[]).is_err());
    }
}
