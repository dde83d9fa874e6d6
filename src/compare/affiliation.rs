//! Affiliation evidence, weighted by how far apart in time two observations are.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{ComparisonModule, FeatureSnapshot, RecordView};
use crate::names::clean_string;
use crate::signature::FieldRef;

/// Month assumed when a date only carries a year.
pub const DEFAULT_MONTH: u8 = 6;

/// Observations further apart than this (in months) carry no temporal signal.
pub const MAX_MONTH_DELTA: u64 = 600;

/// A publication date with optional month precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObservationDate {
    /// Calendar year.
    pub year: i32,
    /// Month `1..=12`, if known.
    #[serde(default)]
    pub month: Option<u8>,
}

impl ObservationDate {
    /// Creates a date with month precision.
    #[must_use]
    pub const fn new(year: i32, month: u8) -> Self {
        Self {
            year,
            month: Some(month),
        }
    }

    /// Creates a year-only date.
    #[must_use]
    pub const fn year(year: i32) -> Self {
        Self { year, month: None }
    }

    /// Months since year 0. Missing or invalid months count as June.
    #[must_use]
    pub fn month_index(self) -> i64 {
        let month = self
            .month
            .filter(|m| (1..=12).contains(m))
            .unwrap_or(DEFAULT_MONTH);
        i64::from(self.year) * 12 + i64::from(month) - 1
    }

    /// Absolute distance in months.
    #[must_use]
    pub fn months_between(self, other: Self) -> u64 {
        self.month_index().abs_diff(other.month_index())
    }
}

impl fmt::Display for ObservationDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.month {
            Some(m) => write!(f, "{:04}-{:02}", self.year, m),
            None => write!(f, "{:04}", self.year),
        }
    }
}

/// Weight of two observations `delta` months apart.
#[must_use]
pub fn temporal_term(delta: u64) -> f64 {
    if delta > MAX_MONTH_DELTA {
        return 0.0;
    }
    #[allow(clippy::cast_precision_loss)]
    let d = delta as f64;
    (-0.05 * d.powf(0.7)).exp()
}

/// One `(date, affiliation)` observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffiliationObservation {
    /// Publication date of the record, if known.
    pub date: Option<ObservationDate>,
    /// Normalized affiliation string.
    pub affiliation: String,
}

impl AffiliationObservation {
    /// Creates an observation, normalizing the affiliation string.
    #[must_use]
    pub fn new(date: Option<ObservationDate>, affiliation: &str) -> Self {
        Self {
            date,
            affiliation: normalize_affiliation(affiliation),
        }
    }
}

fn normalize_affiliation(affiliation: &str) -> String {
    clean_string(affiliation)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Compares affiliation histories.
#[derive(Debug, Clone, Copy, Default)]
pub struct AffiliationModule;

impl AffiliationModule {
    /// Scores two observation lists over every cross pair: the mean string
    /// match indicator and the mean temporal term, averaged.
    #[must_use]
    pub fn score(a: &[AffiliationObservation], b: &[AffiliationObservation]) -> f64 {
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }

        let mut matches = 0usize;
        let mut temporal = 0.0;
        for x in a {
            for y in b {
                if x.affiliation == y.affiliation {
                    matches += 1;
                }
                if let (Some(dx), Some(dy)) = (x.date, y.date) {
                    temporal += temporal_term(dx.months_between(dy));
                }
            }
        }

        #[allow(clippy::cast_precision_loss)]
        let pairs = (a.len() * b.len()) as f64;
        #[allow(clippy::cast_precision_loss)]
        let match_mean = matches as f64 / pairs;
        (match_mean + temporal / pairs) / 2.0
    }
}

impl ComparisonModule for AffiliationModule {
    fn name(&self) -> &'static str {
        "affiliation"
    }

    fn extract(&self, view: &RecordView, subject: &FieldRef) -> FeatureSnapshot {
        let observations: Vec<AffiliationObservation> = view
            .occurrence(subject)
            .map(|o| {
                o.affiliations
                    .iter()
                    .map(|a| AffiliationObservation::new(view.date, a))
                    .filter(|obs| !obs.affiliation.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        if observations.is_empty() {
            FeatureSnapshot::Absent
        } else {
            FeatureSnapshot::Affiliations(observations)
        }
    }

    fn compare(&self, a: &FeatureSnapshot, b: &FeatureSnapshot) -> f64 {
        match (a, b) {
            (FeatureSnapshot::Affiliations(x), FeatureSnapshot::Affiliations(y)) => Self::score(x, y),
            _ => 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::FieldOccurrence;

    fn obs(year: i32, month: Option<u8>, affiliation: &str) -> AffiliationObservation {
        AffiliationObservation::new(Some(ObservationDate { year, month }), affiliation)
    }

    #[test]
    fn test_temporal_term() {
        assert_eq!(temporal_term(0), 1.0);
        assert!((temporal_term(12) - (-0.05 * 12f64.powf(0.7)).exp()).abs() < 1e-12);
        assert!(temporal_term(600) > 0.0);
        assert_eq!(temporal_term(601), 0.0);
    }

    #[test]
    fn test_missing_month_defaults_to_june() {
        let a = ObservationDate::year(2000);
        assert_eq!(a.months_between(ObservationDate::new(2000, 6)), 0);
        assert_eq!(a.months_between(ObservationDate::new(2001, 6)), 12);
        assert_eq!(ObservationDate::new(2000, 13).months_between(a), 0);
    }

    #[test]
    fn test_beyond_cutoff_only_match_contributes() {
        let a = [obs(2000, Some(1), "CERN")];
        let b = [obs(2050, Some(2), "CERN")];
        assert_eq!(a[0].date.unwrap().months_between(b[0].date.unwrap()), 601);
        assert!((AffiliationModule::score(&a, &b) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_same_place_same_time_scores_one() {
        let a = [obs(2010, Some(3), "CERN, Geneva")];
        let b = [obs(2010, Some(3), "cern  geneva")];
        assert!((AffiliationModule::score(&a, &b) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_averages_over_all_pairs() {
        let a = [obs(2010, None, "CERN"), obs(2010, None, "DESY")];
        let b = [obs(2010, None, "CERN")];
        // One of two pairs matches; both pairs are simultaneous.
        assert!((AffiliationModule::score(&a, &b) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_empty_history_scores_zero() {
        assert_eq!(AffiliationModule::score(&[], &[obs(2010, None, "CERN")]), 0.0);
    }

    #[test]
    fn test_extract_uses_subject_affiliations_and_record_date() {
        let subject = FieldRef::new(100, 1);
        let view = RecordView {
            record: 3,
            fields: vec![
                FieldOccurrence::new(subject, "Smith, J.").with_affiliation("CERN"),
                FieldOccurrence::new(FieldRef::new(700, 2), "Doe, A.").with_affiliation("DESY"),
            ],
            collaboration: None,
            date: Some(ObservationDate::year(2012)),
        };
        let module = AffiliationModule;
        match module.extract(&view, &subject) {
            FeatureSnapshot::Affiliations(list) => {
                assert_eq!(list, vec![obs(2012, None, "CERN")]);
            }
            other => panic!("unexpected snapshot {other:?}"),
        }
        assert_eq!(module.extract(&view, &FieldRef::new(700, 9)), FeatureSnapshot::Absent);
    }
}
