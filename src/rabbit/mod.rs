//! The reconciliation engine.
//!
//! A batch walks the requested records, plus every record deleted upstream,
//! in ascending id order. The mutations of one record are collected in a
//! [`RecordPlan`] and committed in a single store call:
//!
//! - **Stage A** pairs the author fields that appeared on the record with the
//!   ones that disappeared, so a corrected spelling keeps its identity.
//! - **Stage B** finds an identity for every field still unresolved: by
//!   external id, by matchable name, by the fallback name keys, or by
//!   creating a new one.
//!
//! A failing record is logged and left untouched; the batch goes on. At the
//! end of the batch every touched identity gets its names and external ids
//! recomputed, and identities left without signatures are pruned.

mod changelog;
mod context;
mod progress;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::assignment::{accepted_matches, Match};
use crate::cache::{PairScore, ScoreCacheStore};
use crate::compare::{Features, ModuleRegistry, RecordView};
use crate::config::RabbitConfig;
use crate::error::{AuthorIdResult, ConfigurationError, ExecutionError};
use crate::identity::IdentityId;
use crate::names::{
    compare_names, create_canonical_name, last_name_cluster, most_relevant_name,
    unique_canonical_name, NameFunction,
};
use crate::signature::{AssignmentStatus, FieldRef, RecordId, Signature, SignatureKey};
use crate::storage::{IdentityStore, MetadataSource, RecordPlan, StorageError};

pub use changelog::{BatchStatus, ChangeLog};
pub use context::BatchContext;
pub use progress::{BatchControl, ChannelMonitor, LogMonitor, Progress, ProgressMonitor};

type NameSimilarity = Arc<dyn Fn(&str, &str) -> f64 + Send + Sync>;

/// How Stage B found an existing identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    ExternalId,
    MatchableName,
    Fallback(NameFunction),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Existing(IdentityId, Step),
    /// `conflict` is set when the name matched an identity that already owns
    /// a signature on the record.
    New { conflict: bool },
}

/// Signatures the plan of the current record detaches, and their owners.
/// They still sit in the store while Stage B runs.
#[derive(Debug, Default)]
struct Detached {
    keys: BTreeSet<SignatureKey>,
    owners: BTreeSet<IdentityId>,
}

/// Author identity reconciliation engine.
pub struct Rabbit {
    config: RabbitConfig,
    registry: ModuleRegistry,
    name_functions: Vec<NameFunction>,
    metadata: Arc<dyn MetadataSource>,
    identities: Arc<dyn IdentityStore>,
    cache_store: Option<ScoreCacheStore>,
    name_similarity: NameSimilarity,
    monitor: Arc<dyn ProgressMonitor>,
}

impl fmt::Debug for Rabbit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rabbit")
            .field("config", &self.config)
            .field("modules", &self.registry.module_names())
            .field("cache_store", &self.cache_store)
            .finish_non_exhaustive()
    }
}

impl Rabbit {
    /// Creates an engine over the given stores.
    ///
    /// # Errors
    /// Any [`ConfigurationError`]; nothing is read or written in that case.
    pub fn new(
        config: RabbitConfig,
        metadata: Arc<dyn MetadataSource>,
        identities: Arc<dyn IdentityStore>,
    ) -> AuthorIdResult<Self> {
        let (config, registry, name_functions) = config.into_parts()?;
        let cache_store = match &config.cache_dir {
            Some(dir) => Some(ScoreCacheStore::open(dir).map_err(|e| ConfigurationError::InvalidValue {
                field: "cache_dir".to_string(),
                reason: format!("{}: {e}", dir.display()),
            })?),
            None => None,
        };

        Ok(Self {
            config,
            registry,
            name_functions,
            metadata,
            identities,
            cache_store,
            name_similarity: Arc::new(compare_names),
            monitor: Arc::new(LogMonitor),
        })
    }

    /// Replaces the Stage A name similarity.
    #[must_use]
    pub fn with_name_similarity(mut self, similarity: impl Fn(&str, &str) -> f64 + Send + Sync + 'static) -> Self {
        self.name_similarity = Arc::new(similarity);
        self
    }

    /// Replaces the progress monitor.
    #[must_use]
    pub fn with_monitor(mut self, monitor: Arc<dyn ProgressMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Effective configuration.
    #[must_use]
    pub fn config(&self) -> &RabbitConfig {
        &self.config
    }

    /// Reconciles `records` and every record deleted upstream.
    ///
    /// Errors on individual records are logged and listed in
    /// [`ChangeLog::skipped_records`]; they never abort the batch.
    ///
    /// # Errors
    /// Storage failures outside of record processing, i.e. while listing
    /// deleted records or reading the canonical names in use.
    pub fn run_batch<I>(&self, records: I, control: &BatchControl) -> AuthorIdResult<ChangeLog>
    where
        I: IntoIterator<Item = RecordId>,
    {
        let mut log = ChangeLog::new(Utc::now());
        let deleted = self.metadata.deleted_record_ids()?;
        let mut batch: BTreeSet<RecordId> = records.into_iter().collect();
        batch.extend(deleted.iter().copied());
        let total = batch.len();
        info!(records = total, deleted = deleted.len(), "rabbit batch started");

        let mut ctx = BatchContext::new();
        for record in batch {
            if !control.checkpoint(record) {
                info!(record, processed = log.processed_records, "rabbit batch stopped");
                log.status = BatchStatus::Stopped;
                break;
            }

            let result = if deleted.contains(&record) {
                self.process_deleted(record, &mut ctx, &mut log)
            } else {
                self.process_record(record, &mut ctx, &mut log)
            };
            if let Err(e) = result {
                warn!(record, error = %e, retryable = e.is_retryable(), "record skipped");
                log.skipped_records.push(record);
            }

            log.processed_records += 1;
            if log.processed_records % self.config.progress_interval == 0 {
                self.monitor.report(Progress {
                    processed: log.processed_records,
                    total,
                    current_record: Some(record),
                });
            }
        }

        self.finish(&mut ctx, &mut log)?;
        self.monitor.report(Progress {
            processed: log.processed_records,
            total,
            current_record: None,
        });
        log.finished_at = Utc::now();
        info!(
            status = ?log.status,
            processed = log.processed_records,
            created = log.created.len(),
            pruned = log.pruned.len(),
            skipped = log.skipped_records.len(),
            "rabbit batch finished"
        );
        Ok(log)
    }

    fn similarity(&self, a: &str, b: &str) -> f64 {
        let score = (self.name_similarity)(a, b);
        if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// Forgets every computed score and the features of `signature`.
    fn invalidate(&self, ctx: &mut BatchContext, signature: &Signature) {
        ctx.reset_scores(&signature.key, &signature.name, self.cache_store.as_ref());
        ctx.drop_features(&signature.key);
    }

    fn process_deleted(&self, record: RecordId, ctx: &mut BatchContext, log: &mut ChangeLog) -> AuthorIdResult<()> {
        let previous = self.identities.signatures_of_record(record)?;
        if previous.is_empty() {
            return Ok(());
        }

        let mut plan = RecordPlan::new(record);
        plan.removals.extend(previous.iter().map(|(_, signature)| signature.key));
        self.identities.apply_record_plan(&plan)?;

        for (id, signature) in &previous {
            ctx.forget(signature, *id);
            ctx.drop_scores(&signature.key, &signature.name, self.cache_store.as_ref());
            log.touched.insert(*id);
            log.deleted_signatures.push(signature.key);
        }
        info!(record, signatures = previous.len(), "detached signatures of deleted record");
        Ok(())
    }

    fn process_record(&self, record: RecordId, ctx: &mut BatchContext, log: &mut ChangeLog) -> AuthorIdResult<()> {
        let view = RecordView::load(self.metadata.as_ref(), record)?
            .ok_or(ExecutionError::RecordVanished { record })?;
        let previous = self.identities.signatures_of_record(record)?;

        let mut current: BTreeMap<FieldRef, Signature> = BTreeMap::new();
        for occurrence in &view.fields {
            if occurrence.name.trim().is_empty() {
                debug!(record, field = %occurrence.field, "ignoring nameless author field");
                continue;
            }
            current
                .entry(occurrence.field)
                .or_insert_with(|| Signature::from_occurrence(record, occurrence));
        }

        // The record is in the batch because its metadata changed, so every
        // score involving one of its signatures is stale.
        for (_, signature) in &previous {
            self.invalidate(ctx, signature);
        }
        for signature in current.values() {
            self.invalidate(ctx, signature);
        }

        let mut plan = RecordPlan::new(record);
        let mut owners = BTreeSet::new();
        let mut updated = Vec::new();
        let mut old = Vec::new();
        let mut respelled = Vec::new();
        for (id, stored) in previous {
            match current.remove(&stored.key.field) {
                Some(now) if self.keeps_identity(&stored, &now) => {
                    owners.insert(id);
                    if now.name != stored.name || now.external_id != stored.external_id {
                        let after = Signature {
                            status: stored.status,
                            ..now
                        };
                        plan.updates.push(after.clone());
                        updated.push((id, stored, after));
                    }
                }
                Some(now) => {
                    debug!(record, field = %now.key.field, from = %stored.name, to = %now.name, "field respelled");
                    old.push((id, stored));
                    respelled.push(now);
                }
                None => old.push((id, stored)),
            }
        }
        let mut new: Vec<Signature> = current.into_values().chain(respelled).collect();
        new.sort_by_key(|s| s.key.field);

        // Stage A: renamed fields keep their identity and status.
        let mut resolved = vec![false; new.len()];
        let mut renamed: Vec<Option<Signature>> = vec![None; old.len()];
        for m in self.match_renames(&new, &old)? {
            let (id, before) = &old[m.old_index];
            let moved = Signature {
                status: before.status,
                ..new[m.new_index].clone()
            };
            debug!(record, from = %before.key, to = %moved.key, score = m.score, "signature renamed");
            plan.renames.push((before.key, moved.clone()));
            owners.insert(*id);
            resolved[m.new_index] = true;
            renamed[m.old_index] = Some(moved);
        }
        let mut detached = Detached::default();
        for ((id, before), moved) in old.iter().zip(&renamed) {
            if moved.is_none() {
                plan.removals.push(before.key);
                detached.keys.insert(before.key);
                detached.owners.insert(*id);
            }
        }

        // Stage B
        let mut conflicts = 0;
        for (signature, _) in new.iter().zip(&resolved).filter(|(_, done)| !**done) {
            let id = match self.resolve(signature, &view, &owners, &detached, ctx)? {
                Resolution::Existing(id, step) => {
                    debug!(record, signature = %signature.key, identity = %id, step = ?step, "signature attached");
                    id
                }
                Resolution::New { conflict } => {
                    let id = self.identities.allocate_identity_id()?;
                    if conflict {
                        conflicts += 1;
                        debug!(record, signature = %signature.key, identity = %id, "double claim, new identity");
                    }
                    plan.created.push(id);
                    id
                }
            };
            owners.insert(id);
            plan.attachments.push((id, signature.clone()));
        }

        if plan.is_empty() {
            return Ok(());
        }
        self.identities.apply_record_plan(&plan)?;

        for ((id, before), moved) in old.iter().zip(&renamed) {
            ctx.forget(before, *id);
            log.touched.insert(*id);
            match moved {
                Some(moved) => {
                    ctx.remember(moved, *id);
                    ctx.rename_scores(before, moved, self.cache_store.as_ref());
                    log.renamed_signatures.push((before.key, moved.key));
                }
                None => {
                    ctx.drop_scores(&before.key, &before.name, self.cache_store.as_ref());
                    log.deleted_signatures.push(before.key);
                }
            }
        }
        for (id, before, after) in &updated {
            ctx.forget(before, *id);
            ctx.remember(after, *id);
            log.touched.insert(*id);
        }
        for (id, signature) in &plan.attachments {
            ctx.remember(signature, *id);
            log.touched.insert(*id);
        }
        log.created.extend(plan.created.iter().copied());
        log.conflicts_resolved += conflicts;

        debug!(
            record,
            removed = plan.removals.len(),
            renamed = plan.renames.len(),
            updated = plan.updates.len(),
            attached = plan.attachments.len(),
            "record committed"
        );
        Ok(())
    }

    /// Whether a changed spelling on an unchanged field keeps the identity.
    /// Claimed signatures always do; others need the Stage A threshold.
    fn keeps_identity(&self, stored: &Signature, now: &Signature) -> bool {
        stored.status == AssignmentStatus::Claimed
            || now.name == stored.name
            || self.similarity(&now.name, &stored.name) > self.config.rename_threshold
    }

    fn match_renames(&self, new: &[Signature], old: &[(IdentityId, Signature)]) -> AuthorIdResult<Vec<Match>> {
        if new.is_empty() || old.is_empty() {
            return Ok(Vec::new());
        }
        let scores: Vec<Vec<f64>> = new
            .iter()
            .map(|n| old.iter().map(|(_, o)| self.similarity(&n.name, &o.name)).collect())
            .collect();
        Ok(accepted_matches(&scores, self.config.rename_threshold)?)
    }

    fn resolve(
        &self,
        signature: &Signature,
        view: &RecordView,
        owners: &BTreeSet<IdentityId>,
        detached: &Detached,
        ctx: &mut BatchContext,
    ) -> AuthorIdResult<Resolution> {
        let store = self.identities.as_ref();
        let rejected = store.rejected_identities(&signature.key)?;
        let eligible = |candidates: BTreeSet<IdentityId>| -> BTreeSet<IdentityId> {
            candidates
                .into_iter()
                .filter(|id| !owners.contains(id) && !rejected.contains(id))
                .collect()
        };

        if self.config.external_id_matching {
            if let Some(external_id) = &signature.external_id {
                let mut candidates = BTreeSet::new();
                for id in eligible(store.find_by_external_id(external_id)?.into_iter().collect()) {
                    let pinned = store
                        .get_identity(id)?
                        .is_some_and(|i| i.pinned_external_ids.contains(external_id));
                    let claimed = |s: &Signature| {
                        s.status == AssignmentStatus::Claimed && s.external_id.as_ref() == Some(external_id)
                    };
                    if pinned || self.still_matches(id, detached, claimed)? {
                        candidates.insert(id);
                    }
                }
                if let Some(id) = self.rank(signature, view, candidates, detached, ctx)? {
                    return Ok(Resolution::Existing(id, Step::ExternalId));
                }
            }
        }

        let by_name = ctx.matchable_candidates(&signature.matchable_name, store)?;
        let double_claim = by_name.iter().any(|id| owners.contains(id));
        let candidates = self.retain_matching(eligible(by_name), detached, |s| {
            s.matchable_name == signature.matchable_name
        })?;
        if let Some(id) = self.rank(signature, view, candidates, detached, ctx)? {
            return Ok(Resolution::Existing(id, Step::MatchableName));
        }
        if double_claim {
            return Ok(Resolution::New { conflict: true });
        }

        for &function in &self.name_functions {
            let Some(key) = function.apply(&signature.name) else {
                continue;
            };
            let candidates = eligible(ctx.fallback_candidates(function, &key, store)?);
            let candidates = self.retain_matching(candidates, detached, |s| {
                function.apply(&s.name).as_ref() == Some(&key)
            })?;
            if let Some(id) = self.rank(signature, view, candidates, detached, ctx)? {
                return Ok(Resolution::Existing(id, Step::Fallback(function)));
            }
        }
        Ok(Resolution::New { conflict: false })
    }

    /// Whether `id` keeps a signature satisfying `matches` once the current
    /// record's detachments are applied.
    fn still_matches(
        &self,
        id: IdentityId,
        detached: &Detached,
        matches: impl Fn(&Signature) -> bool,
    ) -> AuthorIdResult<bool> {
        if !detached.owners.contains(&id) {
            return Ok(true);
        }
        Ok(self
            .identities
            .signatures_of_identity(id)?
            .iter()
            .any(|s| !detached.keys.contains(&s.key) && matches(s)))
    }

    fn retain_matching(
        &self,
        candidates: BTreeSet<IdentityId>,
        detached: &Detached,
        matches: impl Fn(&Signature) -> bool,
    ) -> AuthorIdResult<BTreeSet<IdentityId>> {
        let mut kept = BTreeSet::new();
        for id in candidates {
            if self.still_matches(id, detached, &matches)? {
                kept.insert(id);
            }
        }
        Ok(kept)
    }

    /// Picks the candidate with the highest affinity; ties go to the lowest id.
    fn rank(
        &self,
        signature: &Signature,
        view: &RecordView,
        candidates: BTreeSet<IdentityId>,
        detached: &Detached,
        ctx: &mut BatchContext,
    ) -> AuthorIdResult<Option<IdentityId>> {
        if candidates.len() <= 1 {
            return Ok(candidates.into_iter().next());
        }

        let subject = self.registry.extract(view, &signature.key.field);
        let mut best: Option<(IdentityId, f64)> = None;
        for id in candidates {
            let affinity = self.affinity(signature, &subject, id, detached, ctx)?;
            if best.map_or(true, |(_, top)| affinity > top) {
                best = Some((id, affinity));
            }
        }
        Ok(best.map(|(id, _)| id))
    }

    /// Mean pair score between `signature` and the signatures `id` keeps.
    fn affinity(
        &self,
        signature: &Signature,
        subject: &Features,
        id: IdentityId,
        detached: &Detached,
        ctx: &mut BatchContext,
    ) -> AuthorIdResult<f64> {
        let mut total = 0.0;
        let mut counted = 0u32;
        for other in self.identities.signatures_of_identity(id)? {
            if detached.keys.contains(&other.key) {
                continue;
            }
            if let Some(score) = self.pair_score(signature, subject, &other, ctx)? {
                total += score;
                counted += 1;
            }
        }
        Ok(if counted == 0 {
            0.0
        } else {
            total / f64::from(counted)
        })
    }

    /// Score of one pair, served from the cluster cache when both names share
    /// a surname. `None` if the other signature's record vanished.
    fn pair_score(
        &self,
        signature: &Signature,
        subject: &Features,
        other: &Signature,
        ctx: &mut BatchContext,
    ) -> AuthorIdResult<Option<f64>> {
        let cluster = last_name_cluster(&signature.name);
        let cached = !cluster.is_empty() && cluster == last_name_cluster(&other.name);
        if cached {
            let scores = ctx.cluster_mut(&cluster, self.cache_store.as_ref());
            scores.ensure_member(signature.key);
            scores.ensure_member(other.key);
            let known = scores.get(&signature.key, &other.key)?;
            if known.is_known() {
                return Ok(known.as_probability());
            }
        }

        let Some(features) = self.features_of(other, ctx)? else {
            return Ok(None);
        };
        let score = self.registry.combine(subject, &features);
        if cached {
            #[allow(clippy::cast_possible_truncation)]
            let value = PairScore::Value(score as f32);
            ctx.cluster_mut(&cluster, self.cache_store.as_ref())
                .set(&signature.key, &other.key, value)?;
        }
        Ok(Some(score))
    }

    fn features_of(&self, signature: &Signature, ctx: &mut BatchContext) -> AuthorIdResult<Option<Features>> {
        if let Some(features) = ctx.features(&signature.key) {
            return Ok(Some(features.clone()));
        }
        let Some(view) = RecordView::load(self.metadata.as_ref(), signature.key.record)? else {
            debug!(signature = %signature.key, "record of compared signature vanished");
            return Ok(None);
        };
        if view.occurrence(&signature.key.field).is_none() {
            return Ok(None);
        }
        let features = self.registry.extract(&view, &signature.key.field);
        ctx.store_features(signature.key, features.clone());
        Ok(Some(features))
    }

    /// Recomputes touched identities, prunes empty ones and saves the score
    /// caches.
    fn finish(&self, ctx: &mut BatchContext, log: &mut ChangeLog) -> AuthorIdResult<()> {
        let mut taken = self.identities.canonical_names()?;
        for &id in &log.touched {
            match self.recompute(id, &mut taken) {
                Ok(true) => {
                    log.pruned.insert(id);
                }
                Ok(false) => {}
                Err(e) => warn!(identity = %id, error = %e, "identity recomputation failed"),
            }
        }
        if !log.pruned.is_empty() {
            info!(pruned = log.pruned.len(), "pruned empty identities");
        }

        if let Some(disk) = &self.cache_store {
            let saved = ctx.flush(disk);
            debug!(clusters = saved, "score caches saved");
        }
        Ok(())
    }

    /// Returns true if the identity was pruned.
    fn recompute(&self, id: IdentityId, taken: &mut HashSet<String>) -> Result<bool, StorageError> {
        let signatures = self.identities.signatures_of_identity(id)?;
        if signatures.is_empty() {
            return match self.identities.delete_identity(id) {
                Ok(()) => Ok(true),
                Err(StorageError::IdentityNotFound(_)) => Ok(false),
                Err(e) => Err(e),
            };
        }

        let mut identity = self
            .identities
            .get_identity(id)?
            .ok_or(StorageError::IdentityNotFound(id))?;
        identity.display_name = most_relevant_name(signatures.iter().map(|s| s.name.as_str()));
        if identity.canonical_name.is_none() {
            let base = identity
                .display_name
                .as_deref()
                .map(create_canonical_name)
                .unwrap_or_default();
            if !base.is_empty() {
                let canonical = unique_canonical_name(&base, taken);
                taken.insert(canonical.to_lowercase());
                identity.canonical_name = Some(canonical);
            }
        }
        identity.external_ids = identity.pinned_external_ids.clone();
        identity.external_ids.extend(
            signatures
                .iter()
                .filter(|s| s.status == AssignmentStatus::Claimed)
                .filter_map(|s| s.external_id.clone()),
        );
        identity.updated_at = Utc::now();
        self.identities.update_identity(identity).map(|()| false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::{ModuleSpec, ObservationDate, Operator};
    use crate::signature::FieldOccurrence;
    use crate::storage::{InMemoryIdentityStore, InMemoryMetadataSource, RecordMetadata};

    fn field(value: u64) -> FieldRef {
        FieldRef::new(100, value)
    }

    fn setup() -> (Arc<InMemoryMetadataSource>, Arc<InMemoryIdentityStore>) {
        (Arc::new(InMemoryMetadataSource::new()), Arc::new(InMemoryIdentityStore::new()))
    }

    fn rabbit(metadata: &Arc<InMemoryMetadataSource>, store: &Arc<InMemoryIdentityStore>) -> Rabbit {
        Rabbit::new(RabbitConfig::default(), metadata.clone(), store.clone()).unwrap()
    }

    fn owner(store: &InMemoryIdentityStore, value: u64, record: RecordId) -> Option<IdentityId> {
        store
            .owner_of(&crate::signature::SignatureKey::new(field(value), record))
            .unwrap()
            .map(|(id, _)| id)
    }

    #[test]
    fn test_invalid_config_fails_before_any_record() {
        let (metadata, store) = setup();
        let config = RabbitConfig {
            rename_threshold: -0.1,
            ..RabbitConfig::default()
        };
        let err = Rabbit::new(config, metadata, store).unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_match_renames_respects_threshold() {
        let (metadata, store) = setup();
        let engine = rabbit(&metadata, &store).with_name_similarity(|a, b| if a == "B" && b == "x" { 0.81 } else { 0.8 });
        let id = IdentityId::new(1);
        let new = vec![
            Signature::from_occurrence(1, &FieldOccurrence::new(field(1), "A")),
            Signature::from_occurrence(1, &FieldOccurrence::new(field(2), "B")),
        ];
        let old = vec![(id, Signature::from_occurrence(1, &FieldOccurrence::new(field(3), "x")))];

        let matches = engine.match_renames(&new, &old).unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].new_index, 1);
        assert!(engine.match_renames(&new, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_similarity_is_sanitized() {
        let (metadata, store) = setup();
        let engine = rabbit(&metadata, &store).with_name_similarity(|a, _| match a {
            "nan" => f64::NAN,
            "big" => 3.0,
            _ => -1.0,
        });
        assert_eq!(engine.similarity("nan", ""), 0.0);
        assert_eq!(engine.similarity("big", ""), 1.0);
        assert_eq!(engine.similarity("neg", ""), 0.0);
    }

    #[test]
    fn test_homonyms_ranked_by_coauthors() {
        let (metadata, store) = setup();
        let engine = rabbit(&metadata, &store);
        let date = ObservationDate::new(2015, 3);
        let paper = |coauthor: &str| {
            RecordMetadata::new(vec![
                FieldOccurrence::new(field(1), "Smith, J."),
                FieldOccurrence::new(FieldRef::new(700, 1), coauthor),
            ])
            .with_date(date)
        };

        // Two records by different "Smith, J." authors; the second record
        // carries both names so they end up in separate identities.
        metadata.upsert_record(1, paper("Doe, A.")).unwrap();
        metadata
            .upsert_record(
                2,
                RecordMetadata::new(vec![
                    FieldOccurrence::new(field(1), "Smith, J."),
                    FieldOccurrence::new(field(2), "Smith, J."),
                ]),
            )
            .unwrap();
        let log = engine.run_batch([1, 2], &BatchControl::new()).unwrap();
        assert_eq!(log.conflicts_resolved, 1);
        let first = owner(&store, 1, 1).unwrap();
        assert_eq!(owner(&store, 1, 2), Some(first));
        let second = owner(&store, 2, 2).unwrap();
        assert_ne!(first, second);

        // A new paper sharing the coauthor of record 1 joins the first identity.
        metadata.upsert_record(3, paper("Doe, A.")).unwrap();
        engine.run_batch([3], &BatchControl::new()).unwrap();
        assert_eq!(owner(&store, 1, 3), Some(first));
    }

    #[test]
    fn test_equal_affinity_picks_lowest_id() {
        let (metadata, store) = setup();
        let engine = rabbit(&metadata, &store);
        metadata
            .upsert_record(
                1,
                RecordMetadata::new(vec![
                    FieldOccurrence::new(field(1), "Smith, J."),
                    FieldOccurrence::new(field(2), "Smith, J."),
                ]),
            )
            .unwrap();
        engine.run_batch([1], &BatchControl::new()).unwrap();
        let low = owner(&store, 1, 1).unwrap().min(owner(&store, 2, 1).unwrap());

        metadata
            .upsert_record(2, RecordMetadata::new(vec![FieldOccurrence::new(field(1), "Smith, J.")]))
            .unwrap();
        engine.run_batch([2], &BatchControl::new()).unwrap();
        assert_eq!(owner(&store, 1, 2), Some(low));
    }

    #[test]
    fn test_fallback_name_function_attaches() {
        let (metadata, store) = setup();
        let engine = rabbit(&metadata, &store);
        metadata
            .upsert_record(1, RecordMetadata::new(vec![FieldOccurrence::new(field(1), "Smith, John R.")]))
            .unwrap();
        metadata
            .upsert_record(2, RecordMetadata::new(vec![FieldOccurrence::new(field(1), "Smith, J. R.")]))
            .unwrap();
        let log = engine.run_batch([1, 2], &BatchControl::new()).unwrap();
        assert_eq!(log.created.len(), 1);
        assert_eq!(owner(&store, 1, 1), owner(&store, 1, 2));
    }

    #[test]
    fn test_nameless_fields_are_ignored() {
        let (metadata, store) = setup();
        let engine = rabbit(&metadata, &store);
        metadata
            .upsert_record(
                1,
                RecordMetadata::new(vec![
                    FieldOccurrence::new(field(1), "  "),
                    FieldOccurrence::new(field(2), "Smith, J."),
                ]),
            )
            .unwrap();
        let log = engine.run_batch([1], &BatchControl::new()).unwrap();
        assert_eq!(log.created.len(), 1);
        assert!(owner(&store, 1, 1).is_none());
    }

    #[test]
    fn test_identity_attributes_recomputed() {
        let (metadata, store) = setup();
        let engine = rabbit(&metadata, &store);
        metadata
            .upsert_record(
                1,
                RecordMetadata::new(vec![FieldOccurrence::new(field(1), "Ellis, J. R.").with_external_id("INSPIRE-7")]),
            )
            .unwrap();
        metadata
            .upsert_record(2, RecordMetadata::new(vec![FieldOccurrence::new(field(1), "Ellis, John R.")]))
            .unwrap();
        engine.run_batch([1, 2], &BatchControl::new()).unwrap();

        let id = owner(&store, 1, 1).unwrap();
        assert_eq!(owner(&store, 1, 2), Some(id));
        let identity = store.get_identity(id).unwrap().unwrap();
        assert_eq!(identity.canonical_name.as_deref(), Some("J.R.Ellis.1"));
        assert_eq!(identity.display_name.as_deref(), Some("Ellis, John R."));
        // Unclaimed signatures do not lend their external ids.
        assert!(identity.external_ids.is_empty());

        store
            .claim(&crate::signature::SignatureKey::new(field(1), 1), id)
            .unwrap();
        metadata
            .upsert_record(3, RecordMetadata::new(vec![FieldOccurrence::new(field(1), "Ellis, J. R.")]))
            .unwrap();
        engine.run_batch([3], &BatchControl::new()).unwrap();
        let identity = store.get_identity(id).unwrap().unwrap();
        assert_eq!(identity.external_ids, BTreeSet::from(["INSPIRE-7".to_string()]));
    }

    fn paper(affiliation: &str, year: i32) -> RecordMetadata {
        RecordMetadata::new(vec![
            FieldOccurrence::new(field(1), "Smith, J.").with_affiliation(affiliation),
            FieldOccurrence::new(FieldRef::new(700, 1), "Doe, A."),
            FieldOccurrence::new(FieldRef::new(700, 2), "Roe, B."),
        ])
        .with_date(ObservationDate::new(year, 4))
    }

    fn pair(engine: &Rabbit, metadata: &InMemoryMetadataSource, a: RecordId, b: RecordId, ctx: &mut BatchContext) -> f64 {
        let load = |record| RecordView::load(metadata, record).unwrap().unwrap();
        let view = load(a);
        let sa = Signature::from_occurrence(a, view.occurrence(&field(1)).unwrap());
        let sb = Signature::from_occurrence(b, load(b).occurrence(&field(1)).unwrap());
        let subject = engine.registry.extract(&view, &field(1));
        engine.pair_score(&sa, &subject, &sb, ctx).unwrap().unwrap()
    }

    #[test]
    fn test_pair_scores_are_symmetric() {
        let (metadata, store) = setup();
        let engine = rabbit(&metadata, &store);
        metadata.upsert_record(1, paper("CERN", 2010)).unwrap();
        metadata.upsert_record(2, paper("CERN", 2014)).unwrap();
        metadata.upsert_record(3, paper("DESY", 2030)).unwrap();
        metadata
            .upsert_record(4, RecordMetadata::new(vec![FieldOccurrence::new(field(1), "Smith, J.")]))
            .unwrap();

        let mut shared = BatchContext::new();
        for a in 1..=4 {
            for b in 1..=4 {
                let ab = pair(&engine, &metadata, a, b, &mut BatchContext::new());
                let ba = pair(&engine, &metadata, b, a, &mut BatchContext::new());
                assert!((ab - ba).abs() < 1e-12, "{a}/{b}: {ab} != {ba}");
                assert!((0.0..=1.0).contains(&ab));

                // The cached value serves both directions.
                let first = pair(&engine, &metadata, a, b, &mut shared);
                let second = pair(&engine, &metadata, b, a, &mut shared);
                assert!((first - second).abs() < 1e-6, "{a}/{b}: {first} != {second}");
                assert!((first - ab).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_multiplied_module_gates_the_chain() {
        let (metadata, store) = setup();
        metadata.upsert_record(1, paper("CERN", 2010)).unwrap();
        metadata.upsert_record(2, paper("CERN", 2010)).unwrap();
        metadata.upsert_record(3, paper("DESY", 2010)).unwrap();

        let gated = Rabbit::new(multiplied_chain(), metadata.clone(), store.clone()).unwrap();
        let additive = rabbit(&metadata, &store);
        let shared_coauthors = crate::compare::certainty(2);

        // Same place, same month: the affiliation module scores 1.
        let same = pair(&gated, &metadata, 1, 2, &mut BatchContext::new());
        assert!((same - shared_coauthors).abs() < 1e-9, "got {same}");

        // Different place, same month: only the temporal half remains.
        let moved = pair(&gated, &metadata, 1, 3, &mut BatchContext::new());
        assert!((moved - shared_coauthors * 0.5).abs() < 1e-9, "got {moved}");
        let summed = pair(&additive, &metadata, 1, 3, &mut BatchContext::new());
        assert!((summed - (0.6 * shared_coauthors + 0.4 * 0.5)).abs() < 1e-9, "got {summed}");
    }

    fn multiplied_chain() -> RabbitConfig {
        RabbitConfig {
            modules: vec![
                ModuleSpec::new("coauthors", 1.0, Operator::Add),
                ModuleSpec::new("affiliation", 1.0, Operator::Multiply),
            ],
            ..RabbitConfig::default()
        }
    }

    /// Two "Smith, J." identities: one with five coauthors at CERN, one with
    /// a single coauthor at DESY. Record 12 is a DESY paper with all five.
    fn homonyms_at_two_labs(
        metadata: &InMemoryMetadataSource,
        store: &InMemoryIdentityStore,
    ) -> (IdentityId, IdentityId) {
        let coauthors = ["Doe, A.", "Roe, B.", "Poe, C.", "Loe, D.", "Moe, E."];
        let record = |affiliation: &str, shared: usize| {
            let mut fields = vec![FieldOccurrence::new(field(1), "Smith, J.").with_affiliation(affiliation)];
            fields.extend(
                coauthors[..shared]
                    .iter()
                    .zip(1u64..)
                    .map(|(name, value)| FieldOccurrence::new(FieldRef::new(700, value), *name)),
            );
            RecordMetadata::new(fields).with_date(ObservationDate::new(2012, 1))
        };
        metadata.upsert_record(10, record("CERN", 5)).unwrap();
        metadata.upsert_record(11, record("DESY", 1)).unwrap();
        metadata.upsert_record(12, record("DESY", 5)).unwrap();

        let seed = |record: RecordId| {
            let id = store.allocate_identity_id().unwrap();
            let mut plan = RecordPlan::new(record);
            plan.created.push(id);
            plan.attachments
                .push((id, Signature::from_occurrence(record, &FieldOccurrence::new(field(1), "Smith, J."))));
            store.apply_record_plan(&plan).unwrap();
            id
        };
        (seed(10), seed(11))
    }

    #[test]
    fn test_multiplied_module_decides_between_homonyms() {
        let (metadata, store) = setup();
        let (_, desy) = homonyms_at_two_labs(&metadata, &store);
        let engine = Rabbit::new(multiplied_chain(), metadata.clone(), store.clone()).unwrap();
        engine.run_batch([12], &BatchControl::new()).unwrap();
        assert_eq!(owner(&store, 1, 12), Some(desy));

        // The additive default lets the coauthor overlap win instead.
        let (metadata, store) = setup();
        let (cern, _) = homonyms_at_two_labs(&metadata, &store);
        rabbit(&metadata, &store).run_batch([12], &BatchControl::new()).unwrap();
        assert_eq!(owner(&store, 1, 12), Some(cern));
    }
}
