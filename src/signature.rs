//! Signatures: one occurrence of an author name on one record.
//!
//! A signature is keyed by the author field it came from and the record it
//! sits on. The key is stable across runs as long as the field reference
//! does not change; renames are handled by the reconciliation engine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a bibliographic record.
pub type RecordId = u64;

/// Reference to one author field instance: `(tag, value)`, e.g. `(100, 3)`.
///
/// `tag` distinguishes the main author field from coauthor fields; `value`
/// points at the concrete name string stored for that field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FieldRef {
    /// Author field tag.
    pub tag: u16,
    /// Name value reference inside the tag.
    pub value: u64,
}

impl FieldRef {
    /// Creates a field reference.
    #[must_use]
    pub const fn new(tag: u16, value: u64) -> Self {
        Self { tag, value }
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tag, self.value)
    }
}

/// Stable key of a signature.
///
/// Ordering is by record first, so a sorted set of keys groups signatures of
/// the same record together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignatureKey {
    /// The author field the name was read from.
    pub field: FieldRef,
    /// The record carrying the field.
    pub record: RecordId,
}

impl SignatureKey {
    /// Creates a signature key.
    #[must_use]
    pub const fn new(field: FieldRef, record: RecordId) -> Self {
        Self { field, record }
    }
}

impl PartialOrd for SignatureKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SignatureKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.record, self.field).cmp(&(other.record, other.field))
    }
}

impl fmt::Display for SignatureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.field, self.record)
    }
}

/// How a signature came to belong to its identity.
///
/// Rejections are not a status of the owned signature: a rejected identity
/// does not own the signature, so the store keeps them per signature key
/// (see `IdentityStore::rejected_identities`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    /// Attached by the engine.
    #[default]
    Assigned,
    /// Confirmed by a human; the engine never moves it.
    Claimed,
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Assigned => write!(f, "assigned"),
            Self::Claimed => write!(f, "claimed"),
        }
    }
}

/// One author field as it currently appears in record metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldOccurrence {
    /// Field reference.
    pub field: FieldRef,
    /// Raw name string, e.g. `"Smith, John"`.
    pub name: String,
    /// External author identifier attached to the field, if any.
    #[serde(default)]
    pub external_id: Option<String>,
    /// Affiliations printed next to the name.
    #[serde(default)]
    pub affiliations: Vec<String>,
}

impl FieldOccurrence {
    /// Creates an occurrence with no external id and no affiliations.
    #[must_use]
    pub fn new(field: FieldRef, name: impl Into<String>) -> Self {
        Self {
            field,
            name: name.into(),
            external_id: None,
            affiliations: Vec::new(),
        }
    }

    /// Sets the external identifier.
    #[must_use]
    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    /// Adds an affiliation.
    #[must_use]
    pub fn with_affiliation(mut self, affiliation: impl Into<String>) -> Self {
        self.affiliations.push(affiliation.into());
        self
    }
}

/// A signature as persisted by the identity store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Stable key.
    pub key: SignatureKey,
    /// Raw name string at the time of the last reconciliation.
    pub name: String,
    /// Matchable form of `name`.
    pub matchable_name: String,
    /// External identifier carried by the field, if any.
    #[serde(default)]
    pub external_id: Option<String>,
    /// Assignment status towards the owning identity.
    #[serde(default)]
    pub status: AssignmentStatus,
}

impl Signature {
    /// Builds a signature from a metadata occurrence.
    #[must_use]
    pub fn from_occurrence(record: RecordId, occurrence: &FieldOccurrence) -> Self {
        Self {
            key: SignatureKey::new(occurrence.field, record),
            name: occurrence.name.clone(),
            matchable_name: crate::names::create_matchable_name(&occurrence.name),
            external_id: occurrence.external_id.clone(),
            status: AssignmentStatus::Assigned,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_orders_by_record_then_field() {
        let a = SignatureKey::new(FieldRef::new(700, 1), 1);
        let b = SignatureKey::new(FieldRef::new(100, 9), 2);
        let c = SignatureKey::new(FieldRef::new(100, 1), 2);
        let mut keys = vec![a, b, c];
        keys.sort();
        assert_eq!(keys, vec![a, c, b]);
    }

    #[test]
    fn test_key_display() {
        let key = SignatureKey::new(FieldRef::new(100, 3), 12);
        assert_eq!(key.to_string(), "(100:3,12)");
    }

    #[test]
    fn test_status_serde_snake_case() {
        let json = serde_json::to_string(&AssignmentStatus::Claimed).unwrap();
        assert_eq!(json, "\"claimed\"");
        assert_eq!(AssignmentStatus::default(), AssignmentStatus::Assigned);
        assert_eq!(AssignmentStatus::Assigned.to_string(), "assigned");
    }

    #[test]
    fn test_signature_from_occurrence() {
        let occ = FieldOccurrence::new(FieldRef::new(100, 3), "Smith, J.").with_external_id("INSPIRE-1");
        let sig = Signature::from_occurrence(5, &occ);
        assert_eq!(sig.key.record, 5);
        assert_eq!(sig.matchable_name, "j smith");
        assert_eq!(sig.external_id.as_deref(), Some("INSPIRE-1"));
        assert_eq!(sig.status, AssignmentStatus::Assigned);
    }
}
