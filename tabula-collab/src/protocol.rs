//! JSON envelope and the three-step sync handshake.
//!
//! Every WebSocket text frame carries one [`Envelope`]. Binary payloads
//! (updates, state vectors, awareness) travel as JSON integer arrays.
//!
//! ```text
//!  initiator (client)                      responder (relay room)
//!  ──────────────────                      ──────────────────────
//!  sync-step-1 { stateVector } ──────────►
//!                              ◄────────── sync-step-2 { update, stateVector }
//!  apply, diff vs peer vector
//!  sync-step-3 { update }      ──────────►
//!  synced                                  synced
//!
//!  update / awareness / presence-leave ◄──► any time
//! ```
//!
//! [`SyncProtocol`] is the pure state machine: it owns no socket and never
//! blocks, so the provider actor and the relay server share it.

use serde::{Deserialize, Serialize};
use std::fmt;
use tabula_core::{DocError, Document, Origin};
use thiserror::Error;

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum Envelope {
    #[serde(rename = "sync-step-1")]
    SyncStep1 { state_vector: Vec<u8> },
    #[serde(rename = "sync-step-2")]
    SyncStep2 {
        update: Vec<u8>,
        state_vector: Vec<u8>,
    },
    #[serde(rename = "sync-step-3")]
    SyncStep3 { update: Vec<u8> },
    #[serde(rename = "update")]
    Update { update: Vec<u8> },
    #[serde(rename = "awareness")]
    Awareness { update: Vec<u8> },
    #[serde(rename = "presence-leave")]
    PresenceLeave { user_ids: Vec<String> },
}

impl Envelope {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Wire name, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::SyncStep1 { .. } => "sync-step-1",
            Envelope::SyncStep2 { .. } => "sync-step-2",
            Envelope::SyncStep3 { .. } => "sync-step-3",
            Envelope::Update { .. } => "update",
            Envelope::Awareness { .. } => "awareness",
            Envelope::PresenceLeave { .. } => "presence-leave",
        }
    }
}

/// Connection state reported by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStatus {
    Disconnected,
    Connecting,
    Handshaking,
    Synced,
}

impl SyncStatus {
    /// Anything short of `Synced`: edits are kept locally and sent later.
    pub fn is_offline(self) -> bool {
        self != SyncStatus::Synced
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStatus::Disconnected => "disconnected",
            SyncStatus::Connecting => "connecting",
            SyncStatus::Handshaking => "handshaking",
            SyncStatus::Synced => "synced",
        };
        f.write_str(s)
    }
}

/// A message that cannot be used. The connection survives it.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("bad payload: {0}")]
    Document(#[from] DocError),
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// Drop the message, keep going.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Document state from the peer could not be integrated; a full
    /// snapshot is needed.
    #[error("merge failed: {0}")]
    Merge(DocError),
}

impl SyncError {
    /// Classifies a failure to integrate a tagged document payload. An
    /// unreadable body means the edit is lost unless the state is fetched
    /// again, so it counts as a merge failure; a payload that is not a
    /// document update at all stays a protocol error.
    fn integrating(err: DocError) -> Self {
        match err {
            DocError::Decode(_) | DocError::Integrity(_) => SyncError::Merge(err),
            other => SyncError::from(other),
        }
    }
}

impl From<DocError> for SyncError {
    fn from(err: DocError) -> Self {
        if err.is_integrity() {
            SyncError::Merge(err)
        } else {
            SyncError::Protocol(ProtocolError::Document(err))
        }
    }
}

/// What handling one envelope did to the local document.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Effect {
    #[default]
    Nothing,
    /// These update bytes changed the document.
    Document(Vec<u8>),
    /// Awareness bytes that changed these users.
    Awareness { update: Vec<u8>, users: Vec<String> },
    /// Presence entries that were removed.
    PresenceLeave(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Outcome {
    /// Envelopes to send back on the same connection.
    pub replies: Vec<Envelope>,
    pub effect: Effect,
}

impl Outcome {
    fn reply(envelope: Envelope) -> Self {
        Self {
            replies: vec![envelope],
            effect: Effect::Nothing,
        }
    }

    fn effect(effect: Effect) -> Self {
        Self {
            replies: Vec::new(),
            effect,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Responder,
}

/// Handshake state for one connection.
#[derive(Debug, Clone)]
pub struct SyncProtocol {
    role: Role,
    synced: bool,
}

impl SyncProtocol {
    /// The side that opens the handshake (client provider).
    pub fn initiator() -> Self {
        Self {
            role: Role::Initiator,
            synced: false,
        }
    }

    /// The side that answers it (relay room).
    pub fn responder() -> Self {
        Self {
            role: Role::Responder,
            synced: false,
        }
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// First message on a fresh connection.
    pub fn start(&mut self, doc: &Document) -> Envelope {
        self.synced = false;
        Envelope::SyncStep1 {
            state_vector: doc.encode_state_vector(),
        }
    }

    /// Asks the peer for everything it has. Used after a merge failure.
    pub fn request_snapshot(&mut self) -> Envelope {
        self.synced = false;
        Envelope::SyncStep1 {
            state_vector: Vec::new(),
        }
    }

    /// Applies one incoming envelope. `origin` tags any resulting
    /// transaction.
    pub fn handle(
        &mut self,
        doc: &mut Document,
        envelope: Envelope,
        origin: Origin,
    ) -> Result<Outcome, SyncError> {
        match envelope {
            Envelope::SyncStep1 { state_vector } => {
                log::debug!("sync-step-1 received ({:?})", self.role);
                let update = doc.encode_diff(&state_vector)?;
                Ok(Outcome::reply(Envelope::SyncStep2 {
                    update,
                    state_vector: doc.encode_state_vector(),
                }))
            }
            Envelope::SyncStep2 {
                update,
                state_vector,
            } => {
                log::debug!("sync-step-2 received, {} byte(s)", update.len());
                // Diff first so the reply does not echo what the peer just sent.
                let missing = doc
                    .encode_diff(&state_vector)
                    .map_err(SyncError::integrating)?;
                let changed = integrate(doc, &update, origin)?;
                self.synced = true;
                Ok(Outcome {
                    replies: vec![Envelope::SyncStep3 { update: missing }],
                    effect: changed_effect(changed, update),
                })
            }
            Envelope::SyncStep3 { update } => {
                log::debug!("sync-step-3 received, {} byte(s)", update.len());
                let changed = integrate(doc, &update, origin)?;
                self.synced = true;
                Ok(Outcome::effect(changed_effect(changed, update)))
            }
            Envelope::Update { update } => {
                log::trace!("update received, {} byte(s)", update.len());
                let changed = integrate(doc, &update, origin)?;
                Ok(Outcome::effect(changed_effect(changed, update)))
            }
            Envelope::Awareness { update } => {
                let users = doc.apply_awareness_update(&update)?;
                if users.is_empty() {
                    return Ok(Outcome::default());
                }
                Ok(Outcome::effect(Effect::Awareness { update, users }))
            }
            Envelope::PresenceLeave { user_ids } => {
                let removed = doc.remove_presence(&user_ids);
                if removed.is_empty() {
                    return Ok(Outcome::default());
                }
                Ok(Outcome::effect(Effect::PresenceLeave(removed)))
            }
        }
    }
}

fn integrate(doc: &mut Document, update: &[u8], origin: Origin) -> Result<bool, SyncError> {
    doc.apply_update_from(update, origin)
        .map_err(SyncError::integrating)
}

fn changed_effect(changed: bool, update: Vec<u8>) -> Effect {
    if changed {
        Effect::Document(update)
    } else {
        Effect::Nothing
    }
}
