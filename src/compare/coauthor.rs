//! Coauthorship evidence.
//!
//! Two signatures written by the same person tend to share coauthors. Large
//! author lists are collapsed into a single hash so huge collaborations stay
//! comparable without storing thousands of names per signature.

use std::collections::BTreeSet;

use super::{ComparisonModule, FeatureSnapshot, RecordView};
use crate::names::create_matchable_name;
use crate::signature::FieldRef;

/// Coauthor count above which the list is replaced by its hash.
pub const DEFAULT_COAUTHOR_CAP: usize = 50;

const HASH_PREFIX: &str = "#";

/// Coauthor feature of one signature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoauthorFeature {
    /// Normalized collaboration name, if the record names one.
    pub collaboration: Option<String>,
    /// Matchable names of the coauthors, or a single hash entry.
    pub coauthors: BTreeSet<String>,
}

impl CoauthorFeature {
    /// Returns true if the feature carries no evidence.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.collaboration.is_none() && self.coauthors.is_empty()
    }

    /// Returns true if the coauthor list was collapsed into a hash.
    #[must_use]
    pub fn is_hashed(&self) -> bool {
        self.coauthors.len() == 1 && self.coauthors.iter().all(|c| c.starts_with(HASH_PREFIX))
    }
}

/// Certainty that two signatures share an author given `k` common coauthors.
#[must_use]
pub fn certainty(k: usize) -> f64 {
    if k == 0 {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let k = k as f64;
    1.0 - (-0.8 * k.powf(0.7)).exp()
}

fn normalize_collaboration(name: &str) -> Option<String> {
    let normalized = name
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    (!normalized.is_empty()).then_some(normalized)
}

/// Compares coauthor lists.
#[derive(Debug, Clone)]
pub struct CoauthorModule {
    cap: usize,
}

impl Default for CoauthorModule {
    fn default() -> Self {
        Self::new(DEFAULT_COAUTHOR_CAP)
    }
}

impl CoauthorModule {
    /// Creates the module with the given hashing cap.
    #[must_use]
    pub const fn new(cap: usize) -> Self {
        Self { cap }
    }

    /// Hashing cap.
    #[must_use]
    pub const fn cap(&self) -> usize {
        self.cap
    }

    /// Builds the coauthor feature of `subject` on `view`.
    #[must_use]
    pub fn feature(&self, view: &RecordView, subject: &FieldRef) -> CoauthorFeature {
        if let Some(collaboration) = view.collaboration.as_deref().and_then(normalize_collaboration) {
            return CoauthorFeature {
                collaboration: Some(collaboration),
                coauthors: BTreeSet::new(),
            };
        }

        let raw: Vec<&str> = view
            .fields
            .iter()
            .filter(|o| &o.field != subject)
            .map(|o| o.name.as_str())
            .collect();

        let names: BTreeSet<String> = raw
            .iter()
            .map(|n| create_matchable_name(n))
            .filter(|n| !n.is_empty())
            .collect();

        let coauthors = if raw.len() > self.cap {
            let mut hasher = blake3::Hasher::new();
            for name in &names {
                hasher.update(name.as_bytes());
                hasher.update(b"\n");
            }
            BTreeSet::from([format!("{HASH_PREFIX}{}", hasher.finalize().to_hex())])
        } else {
            names
        };

        CoauthorFeature {
            collaboration: None,
            coauthors,
        }
    }

    /// Scores two coauthor features.
    #[must_use]
    pub fn score(a: &CoauthorFeature, b: &CoauthorFeature) -> f64 {
        if let (Some(x), Some(y)) = (&a.collaboration, &b.collaboration) {
            if x == y {
                return 1.0;
            }
        }
        if a.coauthors.is_empty() || b.coauthors.is_empty() {
            return 0.0;
        }
        certainty(a.coauthors.intersection(&b.coauthors).count())
    }
}

impl ComparisonModule for CoauthorModule {
    fn name(&self) -> &'static str {
        "coauthors"
    }

    fn extract(&self, view: &RecordView, subject: &FieldRef) -> FeatureSnapshot {
        let feature = self.feature(view, subject);
        if feature.is_empty() {
            FeatureSnapshot::Absent
        } else {
            FeatureSnapshot::Coauthors(feature)
        }
    }

    fn compare(&self, a: &FeatureSnapshot, b: &FeatureSnapshot) -> f64 {
        match (a, b) {
            (FeatureSnapshot::Coauthors(x), FeatureSnapshot::Coauthors(y)) => Self::score(x, y),
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::FieldOccurrence;

    fn feature(names: &[&str]) -> CoauthorFeature {
        CoauthorFeature {
            collaboration: None,
            coauthors: names.iter().map(|n| n.to_string()).collect(),
        }
    }

    fn view(names: &[&str]) -> RecordView {
        RecordView {
            record: 1,
            fields: names
                .iter()
                .enumerate()
                .map(|(i, n)| FieldOccurrence::new(FieldRef::new(if i == 0 { 100 } else { 700 }, i as u64), *n))
                .collect(),
            collaboration: None,
            date: None,
        }
    }

    #[test]
    fn test_two_shared_coauthors() {
        let score = CoauthorModule::score(&feature(&["a", "b", "c"]), &feature(&["a", "b", "d"]));
        let expected = 1.0 - (-0.8 * 2f64.powf(0.7)).exp();
        assert!((score - expected).abs() < 1e-12);
        assert!((score - 0.7274).abs() < 1e-3, "got {score}");
    }

    #[test]
    fn test_disjoint_and_empty_sets_score_zero() {
        assert_eq!(CoauthorModule::score(&feature(&["a"]), &feature(&["b"])), 0.0);
        assert_eq!(CoauthorModule::score(&feature(&[]), &feature(&["b"])), 0.0);
        assert_eq!(CoauthorModule::score(&feature(&[]), &feature(&[])), 0.0);
    }

    #[test]
    fn test_scores_are_bounded_and_monotonic() {
        let mut previous = 0.0;
        for k in 0..200 {
            let c = certainty(k);
            assert!((0.0..=1.0).contains(&c));
            assert!(c >= previous);
            previous = c;
        }
    }

    #[test]
    fn test_shared_collaboration_scores_one() {
        let module = CoauthorModule::default();
        let mut a = view(&["Smith, J.", "Doe, A."]);
        a.collaboration = Some("ATLAS  Collaboration".to_string());
        let mut b = view(&["Smith, J."]);
        b.collaboration = Some("atlas collaboration".to_string());

        let fa = module.extract(&a, &FieldRef::new(100, 0));
        let fb = module.extract(&b, &FieldRef::new(100, 0));
        assert_eq!(module.compare(&fa, &fb), 1.0);
    }

    #[test]
    fn test_extract_excludes_subject() {
        let module = CoauthorModule::default();
        let feature = module.feature(&view(&["Smith, J.", "Doe, A.", "Roe, B."]), &FieldRef::new(100, 0));
        assert_eq!(feature.coauthors, BTreeSet::from(["a doe".to_string(), "b roe".to_string()]));
        assert!(!feature.is_hashed());
    }

    #[test]
    fn test_large_lists_are_hashed_stably() {
        let module = CoauthorModule::new(2);
        let subject = FieldRef::new(100, 0);
        let a = module.feature(&view(&["Smith, J.", "Doe, A.", "Roe, B.", "Poe, C."]), &subject);
        let b = module.feature(&view(&["Smith, J.", "Poe, C.", "Roe, B.", "Doe, A."]), &subject);

        assert!(a.is_hashed());
        assert_eq!(a, b);
        assert!(CoauthorModule::score(&a, &b) > 0.5);
    }

    #[test]
    fn test_absent_feature_contributes_zero() {
        let module = CoauthorModule::default();
        let lonely = module.extract(&view(&["Smith, J."]), &FieldRef::new(100, 0));
        assert_eq!(lonely, FeatureSnapshot::Absent);
        assert_eq!(module.compare(&lonely, &lonely), 0.0);
    }
}
