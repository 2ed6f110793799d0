//! Replica identity.
//!
//! A [`ReplicaId`] names one open document instance. It tags remote
//! origins and is the default presence id. Ordering of concurrent writes
//! is left to the yrs client id the store picks on its own.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(pub Uuid);

impl ReplicaId {
    pub const NIL: ReplicaId = ReplicaId(Uuid::nil());

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Deterministic id, handy in tests.
    pub fn from_u128(v: u128) -> Self {
        Self(Uuid::from_u128(v))
    }
}

impl Default for ReplicaId {
    fn default() -> Self {
        Self::random()
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
