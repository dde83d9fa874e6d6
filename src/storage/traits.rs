//! Abstract storage traits for authorid.
//!
//! The engine reads record metadata through [`MetadataSource`] and keeps the
//! signature → identity mapping in an [`IdentityStore`]. Both are owned by
//! collaborators; the in-memory backends in this crate exist for tests,
//! embedded use and the command-line runner.

use std::collections::{BTreeSet, HashSet};

use thiserror::Error;

use crate::compare::ObservationDate;
use crate::identity::{Identity, IdentityId};
use crate::signature::{FieldOccurrence, RecordId, Signature, SignatureKey};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Signature is not owned by any identity.
    #[error("Signature not found: {0}")]
    SignatureNotFound(SignatureKey),

    /// Identity not found.
    #[error("Identity not found: {0}")]
    IdentityNotFound(IdentityId),

    /// Key already exists.
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// Backend error.
    #[error("Storage backend error: {0}")]
    BackendError(String),
}

/// All signature mutations for one record, applied atomically.
///
/// Application order is: removals, renames, updates, identity creation,
/// attachments. Every step is validated before anything is written, so a
/// failing plan leaves the store untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordPlan {
    /// Record the plan belongs to.
    pub record: RecordId,
    /// Signatures to detach from their identities.
    pub removals: Vec<SignatureKey>,
    /// Renamed references: the old key's ownership moves to the new signature.
    pub renames: Vec<(SignatureKey, Signature)>,
    /// Unchanged references whose name or external id changed.
    pub updates: Vec<Signature>,
    /// Freshly allocated identities to create.
    pub created: Vec<IdentityId>,
    /// New ownerships.
    pub attachments: Vec<(IdentityId, Signature)>,
}

impl RecordPlan {
    /// Creates an empty plan.
    #[must_use]
    pub fn new(record: RecordId) -> Self {
        Self {
            record,
            ..Self::default()
        }
    }

    /// Returns true if applying the plan would change nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.removals.is_empty()
            && self.renames.is_empty()
            && self.updates.is_empty()
            && self.created.is_empty()
            && self.attachments.is_empty()
    }

    /// Identities whose signature set the plan changes.
    #[must_use]
    pub fn attached_identities(&self) -> BTreeSet<IdentityId> {
        self.attachments.iter().map(|(id, _)| *id).collect()
    }
}

/// Read access to bibliographic record metadata.
pub trait MetadataSource: Send + Sync {
    /// Author fields currently present on `record`, or `None` if the record
    /// no longer exists.
    fn current_field_references(
        &self,
        record: RecordId,
    ) -> Result<Option<Vec<FieldOccurrence>>, StorageError>;

    /// Records deleted upstream since the last batch.
    fn deleted_record_ids(&self) -> Result<BTreeSet<RecordId>, StorageError>;

    /// Collaboration name printed on the record, if any.
    fn collaboration(&self, record: RecordId) -> Result<Option<String>, StorageError>;

    /// Publication date of the record, if known.
    fn publication_date(&self, record: RecordId) -> Result<Option<ObservationDate>, StorageError>;
}

/// Durable signature → identity mapping.
///
/// A signature key is owned by at most one identity at a time. Rejections
/// are kept separately: a key may carry any number of rejected identities.
pub trait IdentityStore: Send + Sync {
    /// Reserves a fresh identity id. Ids are never handed out twice, even if
    /// the identity is never created.
    fn allocate_identity_id(&self) -> Result<IdentityId, StorageError>;

    /// Get an identity by id.
    fn get_identity(&self, id: IdentityId) -> Result<Option<Identity>, StorageError>;

    /// Replace the attributes of an existing identity.
    fn update_identity(&self, identity: Identity) -> Result<(), StorageError>;

    /// Delete an identity. Fails if it still owns signatures.
    fn delete_identity(&self, id: IdentityId) -> Result<(), StorageError>;

    /// Current owner of a signature.
    fn owner_of(&self, key: &SignatureKey) -> Result<Option<(IdentityId, Signature)>, StorageError>;

    /// Owned signatures of a record, in key order.
    fn signatures_of_record(&self, record: RecordId) -> Result<Vec<(IdentityId, Signature)>, StorageError>;

    /// Signatures owned by an identity, in key order.
    fn signatures_of_identity(&self, id: IdentityId) -> Result<Vec<Signature>, StorageError>;

    /// Every owned signature, in key order.
    fn all_signatures(&self) -> Result<Vec<(IdentityId, Signature)>, StorageError>;

    /// Identities owning a signature with this matchable name, ascending.
    fn find_by_matchable_name(&self, matchable_name: &str) -> Result<Vec<IdentityId>, StorageError>;

    /// Identities carrying this external id, either in their identity-level
    /// set or on a claimed signature, ascending.
    fn find_by_external_id(&self, external_id: &str) -> Result<Vec<IdentityId>, StorageError>;

    /// Identities a human rejected for this signature.
    fn rejected_identities(&self, key: &SignatureKey) -> Result<BTreeSet<IdentityId>, StorageError>;

    /// Pins a signature to an identity with `Claimed` status, moving it away
    /// from its current owner if needed.
    fn claim(&self, key: &SignatureKey, identity: IdentityId) -> Result<(), StorageError>;

    /// Records that a signature does not belong to an identity. If that
    /// identity currently owns it, the signature is detached.
    fn reject(&self, key: &SignatureKey, identity: IdentityId) -> Result<(), StorageError>;

    /// Lower-cased canonical names in use.
    fn canonical_names(&self) -> Result<HashSet<String>, StorageError>;

    /// Applies every mutation of one record atomically.
    fn apply_record_plan(&self, plan: &RecordPlan) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::FieldRef;

    // Compile-time test: ensure traits are object-safe
    fn _assert_metadata_source_object_safe(_: &dyn MetadataSource) {}
    fn _assert_identity_store_object_safe(_: &dyn IdentityStore) {}

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::SignatureNotFound(SignatureKey::new(FieldRef::new(100, 3), 12));
        assert!(err.to_string().contains("(100:3,12)"));

        let err = StorageError::BackendError("connection refused".to_string());
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_empty_plan() {
        let plan = RecordPlan::new(5);
        assert!(plan.is_empty());
        assert_eq!(plan.record, 5);
        assert!(plan.attached_identities().is_empty());
    }
}
