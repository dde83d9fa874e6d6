//! Batch-scoped caches.
//!
//! Everything here lives for exactly one batch and is dropped afterwards;
//! losing it (e.g. on interruption) only costs recomputation.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::warn;

use crate::cache::{PairwiseScores, ScoreCacheStore};
use crate::compare::Features;
use crate::identity::IdentityId;
use crate::names::{last_name_cluster, NameFunction};
use crate::signature::{Signature, SignatureKey};
use crate::storage::{IdentityStore, StorageError};

type NameIndex = HashMap<String, BTreeMap<IdentityId, usize>>;

/// Caches shared by all records of one batch.
#[derive(Debug, Default)]
pub struct BatchContext {
    matchable_names: HashMap<String, BTreeSet<IdentityId>>,
    fallback_indexes: HashMap<NameFunction, NameIndex>,
    features: HashMap<SignatureKey, Features>,
    clusters: HashMap<String, PairwiseScores>,
    dirty_clusters: BTreeSet<String>,
}

impl BatchContext {
    /// Creates empty caches.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Identities owning a signature with this matchable name.
    ///
    /// A miss goes to the store and the answer is cached.
    pub fn matchable_candidates(
        &mut self,
        matchable_name: &str,
        store: &dyn IdentityStore,
    ) -> Result<BTreeSet<IdentityId>, StorageError> {
        if let Some(ids) = self.matchable_names.get(matchable_name) {
            return Ok(ids.clone());
        }
        let ids: BTreeSet<IdentityId> = store.find_by_matchable_name(matchable_name)?.into_iter().collect();
        self.matchable_names.insert(matchable_name.to_string(), ids.clone());
        Ok(ids)
    }

    /// Identities owning a signature whose `function` key equals `key`.
    ///
    /// The index of a function is built from the whole store on first use.
    pub fn fallback_candidates(
        &mut self,
        function: NameFunction,
        key: &str,
        store: &dyn IdentityStore,
    ) -> Result<BTreeSet<IdentityId>, StorageError> {
        if !self.fallback_indexes.contains_key(&function) {
            let mut index = NameIndex::new();
            for (id, signature) in store.all_signatures()? {
                if let Some(k) = function.apply(&signature.name) {
                    *index.entry(k).or_default().entry(id).or_default() += 1;
                }
            }
            self.fallback_indexes.insert(function, index);
        }
        Ok(self
            .fallback_indexes
            .get(&function)
            .and_then(|index| index.get(key))
            .map(|ids| ids.keys().copied().collect())
            .unwrap_or_default())
    }

    /// Records that `signature` now belongs to `id`.
    pub fn remember(&mut self, signature: &Signature, id: IdentityId) {
        if let Some(ids) = self.matchable_names.get_mut(&signature.matchable_name) {
            ids.insert(id);
        }
        for (function, index) in &mut self.fallback_indexes {
            if let Some(k) = function.apply(&signature.name) {
                *index.entry(k).or_default().entry(id).or_default() += 1;
            }
        }
    }

    /// Records that `signature` no longer belongs to `id`.
    pub fn forget(&mut self, signature: &Signature, id: IdentityId) {
        // Other signatures of `id` may share the name; reload on next lookup.
        self.matchable_names.remove(&signature.matchable_name);
        for (function, index) in &mut self.fallback_indexes {
            let Some(k) = function.apply(&signature.name) else {
                continue;
            };
            if let Some(ids) = index.get_mut(&k) {
                if let Some(count) = ids.get_mut(&id) {
                    *count -= 1;
                    if *count == 0 {
                        ids.remove(&id);
                    }
                }
                if ids.is_empty() {
                    index.remove(&k);
                }
            }
        }
        self.features.remove(&signature.key);
    }

    /// Cached features of a signature.
    #[must_use]
    pub fn features(&self, key: &SignatureKey) -> Option<&Features> {
        self.features.get(key)
    }

    /// Caches the features of a signature.
    pub fn store_features(&mut self, key: SignatureKey, features: Features) {
        self.features.insert(key, features);
    }

    /// Drops cached features of a signature.
    pub fn drop_features(&mut self, key: &SignatureKey) {
        self.features.remove(key);
    }

    /// Score cache of a cluster, loaded from disk on first use.
    pub fn cluster_mut(&mut self, cluster: &str, disk: Option<&ScoreCacheStore>) -> &mut PairwiseScores {
        if !self.clusters.contains_key(cluster) {
            let scores = disk.map(|d| d.load(cluster)).unwrap_or_default();
            self.clusters.insert(cluster.to_string(), scores);
        }
        self.dirty_clusters.insert(cluster.to_string());
        self.clusters.entry(cluster.to_string()).or_default()
    }

    /// Resets the computed scores of `key` in the cluster of `name`.
    pub fn reset_scores(&mut self, key: &SignatureKey, name: &str, disk: Option<&ScoreCacheStore>) {
        let cluster = last_name_cluster(name);
        if !cluster.is_empty() {
            self.cluster_mut(&cluster, disk).forget_computed(key);
        }
    }

    /// Removes `key` from the cluster of `name`.
    pub fn drop_scores(&mut self, key: &SignatureKey, name: &str, disk: Option<&ScoreCacheStore>) {
        let cluster = last_name_cluster(name);
        if !cluster.is_empty() {
            self.cluster_mut(&cluster, disk).remove_member(key);
        }
    }

    /// Moves the cached scores of `old` to `renamed`, or drops them if the
    /// surname changed.
    pub fn rename_scores(&mut self, old: &Signature, renamed: &Signature, disk: Option<&ScoreCacheStore>) {
        let from = last_name_cluster(&old.name);
        if from.is_empty() {
            return;
        }
        let same_cluster = from == last_name_cluster(&renamed.name);
        let scores = self.cluster_mut(&from, disk);
        if !same_cluster || scores.rename_member(&old.key, renamed.key).is_err() {
            scores.remove_member(&old.key);
        }
    }

    /// Persists every cluster touched during the batch; a cluster left
    /// without members loses its file. Failures are logged and the caches
    /// are rebuilt on demand next time.
    pub fn flush(&mut self, disk: &ScoreCacheStore) -> usize {
        let mut saved = 0;
        for cluster in std::mem::take(&mut self.dirty_clusters) {
            let Some(scores) = self.clusters.get_mut(&cluster) else {
                continue;
            };
            let result = if scores.is_empty() {
                disk.remove(&cluster)
            } else {
                disk.save(&cluster, scores)
            };
            match result {
                Ok(()) => saved += 1,
                Err(e) => warn!(cluster = %cluster, error = %e, "failed to persist score cache"),
            }
        }
        saved
    }

    /// Number of clusters modified since the last flush.
    #[must_use]
    pub fn dirty_cluster_count(&self) -> usize {
        self.dirty_clusters.len()
    }
}
