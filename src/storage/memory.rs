//! In-memory storage backend.
//!
//! This module provides thread-safe in-memory implementations of the storage traits.
//! It is intended for embedded usage, tests, and as a reference implementation.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::RwLock;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::compare::ObservationDate;
use crate::identity::{Identity, IdentityId};
use crate::signature::{AssignmentStatus, FieldOccurrence, FieldRef, RecordId, Signature, SignatureKey};
use crate::storage::traits::{IdentityStore, MetadataSource, RecordPlan, StorageError};

fn lock_err(context: &'static str) -> StorageError {
    StorageError::BackendError(format!("poisoned lock: {context}"))
}

fn record_range(record: RecordId) -> RangeInclusive<SignatureKey> {
    SignatureKey::new(FieldRef::new(0, 0), record)..=SignatureKey::new(FieldRef::new(u16::MAX, u64::MAX), record)
}

/// Metadata of one record as held by [`InMemoryMetadataSource`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    /// Author fields in field order.
    pub fields: Vec<FieldOccurrence>,
    /// Collaboration name, if printed on the record.
    #[serde(default)]
    pub collaboration: Option<String>,
    /// Publication date.
    #[serde(default)]
    pub date: Option<ObservationDate>,
}

impl RecordMetadata {
    /// Creates record metadata with the given author fields.
    #[must_use]
    pub fn new(fields: Vec<FieldOccurrence>) -> Self {
        Self {
            fields,
            collaboration: None,
            date: None,
        }
    }

    /// Sets the collaboration name.
    #[must_use]
    pub fn with_collaboration(mut self, collaboration: impl Into<String>) -> Self {
        self.collaboration = Some(collaboration.into());
        self
    }

    /// Sets the publication date.
    #[must_use]
    pub fn with_date(mut self, date: ObservationDate) -> Self {
        self.date = Some(date);
        self
    }
}

#[derive(Debug, Default)]
struct MetadataState {
    records: BTreeMap<RecordId, RecordMetadata>,
    deleted: BTreeSet<RecordId>,
}

/// Thread-safe in-memory record metadata.
#[derive(Debug, Default)]
pub struct InMemoryMetadataSource {
    state: RwLock<MetadataState>,
}

impl InMemoryMetadataSource {
    /// Create a new empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a record. A previously deleted record comes back.
    pub fn upsert_record(&self, record: RecordId, metadata: RecordMetadata) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("metadata.upsert_record"))?;
        state.deleted.remove(&record);
        state.records.insert(record, metadata);
        Ok(())
    }

    /// Deletes a record and flags it as deleted. Returns false if it did not exist.
    pub fn delete_record(&self, record: RecordId) -> Result<bool, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("metadata.delete_record"))?;
        let existed = state.records.remove(&record).is_some();
        if existed {
            state.deleted.insert(record);
        }
        Ok(existed)
    }

    /// Forgets the deletion flags, e.g. after a batch consumed them.
    pub fn clear_deleted(&self) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("metadata.clear_deleted"))?;
        state.deleted.clear();
        Ok(())
    }

    /// Ids of all live records, ascending.
    pub fn record_ids(&self) -> Result<Vec<RecordId>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("metadata.record_ids"))?;
        Ok(state.records.keys().copied().collect())
    }
}

impl MetadataSource for InMemoryMetadataSource {
    fn current_field_references(
        &self,
        record: RecordId,
    ) -> Result<Option<Vec<FieldOccurrence>>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("metadata.current_field_references"))?;
        Ok(state.records.get(&record).map(|m| m.fields.clone()))
    }

    fn deleted_record_ids(&self) -> Result<BTreeSet<RecordId>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("metadata.deleted_record_ids"))?;
        Ok(state.deleted.clone())
    }

    fn collaboration(&self, record: RecordId) -> Result<Option<String>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("metadata.collaboration"))?;
        Ok(state.records.get(&record).and_then(|m| m.collaboration.clone()))
    }

    fn publication_date(&self, record: RecordId) -> Result<Option<ObservationDate>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("metadata.publication_date"))?;
        Ok(state.records.get(&record).and_then(|m| m.date))
    }
}

/// A signature together with its owner, as serialized in snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedSignature {
    /// Owning identity.
    pub identity: IdentityId,
    /// The signature.
    #[serde(flatten)]
    pub signature: Signature,
}

/// A human rejection of one identity for one signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// Signature key.
    pub key: SignatureKey,
    /// Rejected identity.
    pub identity: IdentityId,
}

/// Serializable state of an [`InMemoryIdentityStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySnapshot {
    /// Next id to allocate.
    #[serde(default)]
    pub next_id: u64,
    /// Identities, ascending by id.
    #[serde(default)]
    pub identities: Vec<Identity>,
    /// Owned signatures, in key order.
    #[serde(default)]
    pub signatures: Vec<OwnedSignature>,
    /// Recorded rejections.
    #[serde(default)]
    pub rejections: Vec<Rejection>,
}

#[derive(Debug)]
enum Undo {
    Attached(SignatureKey),
    Detached(IdentityId, Signature),
    Rejections(SignatureKey, Option<BTreeSet<IdentityId>>),
    Created(IdentityId),
}

#[derive(Debug, Default)]
struct IdentityState {
    next_id: u64,
    identities: BTreeMap<IdentityId, Identity>,
    owners: BTreeMap<SignatureKey, (IdentityId, Signature)>,
    by_identity: HashMap<IdentityId, BTreeSet<SignatureKey>>,
    by_matchable: HashMap<String, BTreeSet<SignatureKey>>,
    by_external_id: HashMap<String, BTreeSet<SignatureKey>>,
    rejections: BTreeMap<SignatureKey, BTreeSet<IdentityId>>,
}

impl IdentityState {
    fn attach(&mut self, id: IdentityId, signature: Signature) -> Result<(), StorageError> {
        if !self.identities.contains_key(&id) {
            return Err(StorageError::IdentityNotFound(id));
        }
        let key = signature.key;
        if self.owners.contains_key(&key) {
            return Err(StorageError::DuplicateKey(key.to_string()));
        }

        self.by_identity.entry(id).or_default().insert(key);
        self.by_matchable
            .entry(signature.matchable_name.clone())
            .or_default()
            .insert(key);
        if let Some(ext) = signature.external_id.as_ref() {
            self.by_external_id.entry(ext.clone()).or_default().insert(key);
        }
        self.owners.insert(key, (id, signature));
        Ok(())
    }

    fn detach(&mut self, key: &SignatureKey) -> Result<(IdentityId, Signature), StorageError> {
        let (id, signature) = self
            .owners
            .remove(key)
            .ok_or(StorageError::SignatureNotFound(*key))?;

        if let Some(keys) = self.by_identity.get_mut(&id) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_identity.remove(&id);
            }
        }
        if let Some(keys) = self.by_matchable.get_mut(&signature.matchable_name) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_matchable.remove(&signature.matchable_name);
            }
        }
        if let Some(ext) = signature.external_id.as_ref() {
            if let Some(keys) = self.by_external_id.get_mut(ext) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_external_id.remove(ext);
                }
            }
        }
        Ok((id, signature))
    }

    fn set_rejections(&mut self, key: SignatureKey, value: Option<BTreeSet<IdentityId>>, undo: &mut Vec<Undo>) {
        let previous = match value {
            Some(set) if !set.is_empty() => self.rejections.insert(key, set),
            _ => self.rejections.remove(&key),
        };
        undo.push(Undo::Rejections(key, previous));
    }

    fn apply_plan(&mut self, plan: &RecordPlan, undo: &mut Vec<Undo>) -> Result<(), StorageError> {
        for key in &plan.removals {
            let (id, signature) = self.detach(key)?;
            undo.push(Undo::Detached(id, signature));
            self.set_rejections(*key, None, undo);
        }

        // Renames may swap references, so every source leaves before any target lands.
        let mut moving = Vec::with_capacity(plan.renames.len());
        for (old, renamed) in &plan.renames {
            let (id, signature) = self.detach(old)?;
            undo.push(Undo::Detached(id, signature));
            let moved = self.rejections.get(old).cloned();
            self.set_rejections(*old, None, undo);
            moving.push((id, renamed, moved));
        }
        for (id, renamed, moved) in moving {
            if moved.is_some() {
                self.set_rejections(renamed.key, moved, undo);
            }
            self.attach(id, renamed.clone())?;
            undo.push(Undo::Attached(renamed.key));
        }

        for updated in &plan.updates {
            let (id, previous) = self.detach(&updated.key)?;
            let status = previous.status;
            undo.push(Undo::Detached(id, previous));
            let mut updated = updated.clone();
            updated.status = status;
            let key = updated.key;
            self.attach(id, updated)?;
            undo.push(Undo::Attached(key));
        }

        for id in &plan.created {
            if self.identities.contains_key(id) {
                return Err(StorageError::DuplicateKey(id.to_string()));
            }
            if id.get() >= self.next_id {
                return Err(StorageError::BackendError(format!("identity id {id} was never allocated")));
            }
            self.identities.insert(*id, Identity::new(*id));
            undo.push(Undo::Created(*id));
        }

        for (id, signature) in &plan.attachments {
            self.attach(*id, signature.clone())?;
            undo.push(Undo::Attached(signature.key));
        }
        Ok(())
    }

    fn rollback(&mut self, undo: Vec<Undo>) {
        for step in undo.into_iter().rev() {
            match step {
                Undo::Attached(key) => {
                    let _ = self.detach(&key);
                }
                Undo::Detached(id, signature) => {
                    let _ = self.attach(id, signature);
                }
                Undo::Rejections(key, previous) => match previous {
                    Some(set) => {
                        self.rejections.insert(key, set);
                    }
                    None => {
                        self.rejections.remove(&key);
                    }
                },
                Undo::Created(id) => {
                    self.identities.remove(&id);
                }
            }
        }
    }
}

/// Thread-safe in-memory identity store.
#[derive(Debug, Default)]
pub struct InMemoryIdentityStore {
    state: RwLock<IdentityState>,
}

impl InMemoryIdentityStore {
    /// Create a new empty store. The first allocated id is 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(IdentityState {
                next_id: 1,
                ..IdentityState::default()
            }),
        }
    }

    /// Rebuilds a store from a snapshot.
    ///
    /// # Errors
    /// `DuplicateKey` if the snapshot lists an identity or signature twice,
    /// `IdentityNotFound` if a signature points at a missing identity.
    pub fn from_snapshot(snapshot: IdentitySnapshot) -> Result<Self, StorageError> {
        let mut state = IdentityState::default();
        for identity in snapshot.identities {
            let id = identity.id;
            if state.identities.insert(id, identity).is_some() {
                return Err(StorageError::DuplicateKey(id.to_string()));
            }
        }
        for owned in snapshot.signatures {
            state.attach(owned.identity, owned.signature)?;
        }
        for rejection in snapshot.rejections {
            state
                .rejections
                .entry(rejection.key)
                .or_default()
                .insert(rejection.identity);
        }

        let max_seen = state.identities.keys().next_back().map_or(0, |id| id.get());
        state.next_id = snapshot.next_id.max(max_seen + 1).max(1);
        Ok(Self {
            state: RwLock::new(state),
        })
    }

    /// Captures the current state.
    pub fn snapshot(&self) -> Result<IdentitySnapshot, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("identity.snapshot"))?;
        Ok(IdentitySnapshot {
            next_id: state.next_id,
            identities: state.identities.values().cloned().collect(),
            signatures: state
                .owners
                .values()
                .map(|(identity, signature)| OwnedSignature {
                    identity: *identity,
                    signature: signature.clone(),
                })
                .collect(),
            rejections: state
                .rejections
                .iter()
                .flat_map(|(key, ids)| ids.iter().map(|id| Rejection { key: *key, identity: *id }))
                .collect(),
        })
    }
}

impl IdentityStore for InMemoryIdentityStore {
    fn allocate_identity_id(&self) -> Result<IdentityId, StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("identity.allocate"))?;
        let id = IdentityId::new(state.next_id);
        state.next_id += 1;
        Ok(id)
    }

    fn get_identity(&self, id: IdentityId) -> Result<Option<Identity>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("identity.get"))?;
        Ok(state.identities.get(&id).cloned())
    }

    fn update_identity(&self, identity: Identity) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("identity.update"))?;
        match state.identities.get_mut(&identity.id) {
            Some(slot) => {
                *slot = identity;
                Ok(())
            }
            None => Err(StorageError::IdentityNotFound(identity.id)),
        }
    }

    fn delete_identity(&self, id: IdentityId) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("identity.delete"))?;
        if !state.identities.contains_key(&id) {
            return Err(StorageError::IdentityNotFound(id));
        }
        if state.by_identity.get(&id).is_some_and(|keys| !keys.is_empty()) {
            return Err(StorageError::BackendError(format!(
                "identity {id} still owns signatures"
            )));
        }
        state.identities.remove(&id);
        state.by_identity.remove(&id);
        Ok(())
    }

    fn owner_of(&self, key: &SignatureKey) -> Result<Option<(IdentityId, Signature)>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("identity.owner_of"))?;
        Ok(state.owners.get(key).cloned())
    }

    fn signatures_of_record(&self, record: RecordId) -> Result<Vec<(IdentityId, Signature)>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("identity.signatures_of_record"))?;
        Ok(state
            .owners
            .range(record_range(record))
            .map(|(_, owned)| owned.clone())
            .collect())
    }

    fn signatures_of_identity(&self, id: IdentityId) -> Result<Vec<Signature>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("identity.signatures_of_identity"))?;
        let Some(keys) = state.by_identity.get(&id) else {
            return Ok(Vec::new());
        };
        Ok(keys
            .iter()
            .filter_map(|k| state.owners.get(k).map(|(_, s)| s.clone()))
            .collect())
    }

    fn all_signatures(&self) -> Result<Vec<(IdentityId, Signature)>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("identity.all_signatures"))?;
        Ok(state.owners.values().cloned().collect())
    }

    fn find_by_matchable_name(&self, matchable_name: &str) -> Result<Vec<IdentityId>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("identity.find_by_matchable_name"))?;
        let ids: BTreeSet<IdentityId> = state
            .by_matchable
            .get(matchable_name)
            .into_iter()
            .flatten()
            .filter_map(|k| state.owners.get(k).map(|(id, _)| *id))
            .collect();
        Ok(ids.into_iter().collect())
    }

    fn find_by_external_id(&self, external_id: &str) -> Result<Vec<IdentityId>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("identity.find_by_external_id"))?;
        let mut ids: BTreeSet<IdentityId> = state
            .by_external_id
            .get(external_id)
            .into_iter()
            .flatten()
            .filter_map(|k| state.owners.get(k))
            .filter(|(_, s)| s.status == AssignmentStatus::Claimed)
            .map(|(id, _)| *id)
            .collect();
        ids.extend(
            state
                .identities
                .values()
                .filter(|i| i.pinned_external_ids.contains(external_id))
                .map(|i| i.id),
        );
        Ok(ids.into_iter().collect())
    }

    fn rejected_identities(&self, key: &SignatureKey) -> Result<BTreeSet<IdentityId>, StorageError> {
        let state = self
            .state
            .read()
            .map_err(|_| lock_err("identity.rejected_identities"))?;
        Ok(state.rejections.get(key).cloned().unwrap_or_default())
    }

    fn claim(&self, key: &SignatureKey, identity: IdentityId) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("identity.claim"))?;
        if !state.identities.contains_key(&identity) {
            return Err(StorageError::IdentityNotFound(identity));
        }
        let (_, mut signature) = state.detach(key)?;
        signature.status = AssignmentStatus::Claimed;
        state.attach(identity, signature)?;
        if let Some(rejected) = state.rejections.get_mut(key) {
            rejected.remove(&identity);
            if rejected.is_empty() {
                state.rejections.remove(key);
            }
        }
        Ok(())
    }

    fn reject(&self, key: &SignatureKey, identity: IdentityId) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| lock_err("identity.reject"))?;
        if !state.identities.contains_key(&identity) {
            return Err(StorageError::IdentityNotFound(identity));
        }
        if state.owners.get(key).is_some_and(|(owner, _)| *owner == identity) {
            state.detach(key)?;
        }
        state.rejections.entry(*key).or_default().insert(identity);
        Ok(())
    }

    fn canonical_names(&self) -> Result<HashSet<String>, StorageError> {
        let state = self.state.read().map_err(|_| lock_err("identity.canonical_names"))?;
        Ok(state
            .identities
            .values()
            .filter_map(|i| i.canonical_name.as_ref())
            .map(|n| n.to_lowercase())
            .collect())
    }

    fn apply_record_plan(&self, plan: &RecordPlan) -> Result<(), StorageError> {
        let foreign = plan
            .removals
            .iter()
            .chain(plan.renames.iter().flat_map(|(old, new)| [old, &new.key]))
            .chain(plan.updates.iter().map(|s| &s.key))
            .chain(plan.attachments.iter().map(|(_, s)| &s.key))
            .find(|k| k.record != plan.record);
        if let Some(key) = foreign {
            return Err(StorageError::BackendError(format!(
                "plan for record {} touches foreign signature {key}",
                plan.record
            )));
        }

        let mut state = self.state.write().map_err(|_| lock_err("identity.apply_record_plan"))?;
        let mut undo = Vec::new();
        if let Err(e) = state.apply_plan(plan, &mut undo) {
            state.rollback(undo);
            return Err(e);
        }

        let now = Utc::now();
        for id in plan.attached_identities() {
            if let Some(identity) = state.identities.get_mut(&id) {
                identity.updated_at = now;
            }
        }
        Ok(())
    }
}
