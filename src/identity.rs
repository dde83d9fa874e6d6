//! Identities: persisted clusters of signatures believed to denote one author.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Numeric identity id. Ids are allocated by the identity store and never
/// reused within one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(u64);

impl IdentityId {
    /// Wraps a raw id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw id.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for IdentityId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// A real-world author as known to the store.
///
/// Signature ownership lives in the identity store, not here; this struct
/// only carries the identity-level attributes recomputed at the end of each
/// batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Identity id.
    pub id: IdentityId,
    /// Unique human-readable id, e.g. `J.Smith.1`.
    #[serde(default)]
    pub canonical_name: Option<String>,
    /// Most informative spelling among the owned signatures.
    #[serde(default)]
    pub display_name: Option<String>,
    /// External author identifiers: the pinned ones plus those carried by
    /// claimed signatures. Only these attract new signatures.
    #[serde(default)]
    pub external_ids: BTreeSet<String>,
    /// External identifiers set by a human; they survive recomputation.
    #[serde(default)]
    pub pinned_external_ids: BTreeSet<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time of the last attribute recomputation.
    pub updated_at: DateTime<Utc>,
}

impl Identity {
    /// Creates a bare identity.
    #[must_use]
    pub fn new(id: IdentityId) -> Self {
        let now = Utc::now();
        Self {
            id,
            canonical_name: None,
            display_name: None,
            external_ids: BTreeSet::new(),
            pinned_external_ids: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Pins an external identifier to the identity.
    pub fn pin_external_id(&mut self, external_id: impl Into<String>) {
        let external_id = external_id.into();
        self.external_ids.insert(external_id.clone());
        self.pinned_external_ids.insert(external_id);
    }
}
