//! Comparison modules and their registry.
//!
//! A comparison module turns one observable dimension of a signature (its
//! coauthors, its affiliations) into a feature snapshot and scores two
//! snapshots in `[0, 1]`. The [`ModuleRegistry`] holds the configured,
//! ordered chain of modules and folds their weighted scores into a single
//! affinity:
//!
//! ```text
//! acc = 0
//! for (module, weight, op) in chain:
//!     s = weight * module.compare(a, b)
//!     acc = acc + s      if op == '+'
//!     acc = acc * s      if op == '*'
//! affinity = clamp(acc, 0, 1)
//! ```

mod affiliation;
mod coauthor;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::signature::{FieldOccurrence, FieldRef, RecordId};
use crate::storage::{MetadataSource, StorageError};

pub use affiliation::{
    temporal_term, AffiliationModule, AffiliationObservation, ObservationDate, DEFAULT_MONTH,
    MAX_MONTH_DELTA,
};
pub use coauthor::{certainty, CoauthorFeature, CoauthorModule, DEFAULT_COAUTHOR_CAP};

/// Everything the modules may look at on one record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordView {
    /// Record id.
    pub record: RecordId,
    /// Author fields currently on the record.
    pub fields: Vec<FieldOccurrence>,
    /// Collaboration name, if any.
    pub collaboration: Option<String>,
    /// Publication date, if known.
    pub date: Option<ObservationDate>,
}

impl RecordView {
    /// Reads a record from the metadata source, or `None` if it vanished.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub fn load(source: &dyn MetadataSource, record: RecordId) -> Result<Option<Self>, StorageError> {
        let Some(fields) = source.current_field_references(record)? else {
            return Ok(None);
        };
        Ok(Some(Self {
            record,
            fields,
            collaboration: source.collaboration(record)?,
            date: source.publication_date(record)?,
        }))
    }

    /// The occurrence of `field` on this record.
    #[must_use]
    pub fn occurrence(&self, field: &FieldRef) -> Option<&FieldOccurrence> {
        self.fields.iter().find(|o| &o.field == field)
    }
}

/// Module-specific feature of one signature.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureSnapshot {
    /// Nothing observable.
    Absent,
    /// Coauthor names or collaboration.
    Coauthors(CoauthorFeature),
    /// Dated affiliations.
    Affiliations(Vec<AffiliationObservation>),
}

/// One scoring dimension.
pub trait ComparisonModule: Send + Sync + fmt::Debug {
    /// Configuration name of the module.
    fn name(&self) -> &'static str;

    /// Extracts the feature of `subject` on `view`.
    fn extract(&self, view: &RecordView, subject: &FieldRef) -> FeatureSnapshot;

    /// Scores two features in `[0, 1]`. Mismatched or absent features score 0.
    fn compare(&self, a: &FeatureSnapshot, b: &FeatureSnapshot) -> f64;
}

/// How a module's weighted score joins the accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    /// `acc + weight * score`
    Add,
    /// `acc * (weight * score)`
    Multiply,
}

impl Operator {
    /// Parses `"+"` or `"*"`.
    ///
    /// # Errors
    /// `UnknownOperator` for anything else.
    pub fn parse(module: &str, operator: &str) -> Result<Self, ConfigurationError> {
        match operator.trim() {
            "+" => Ok(Self::Add),
            "*" => Ok(Self::Multiply),
            other => Err(ConfigurationError::UnknownOperator {
                name: module.to_string(),
                operator: other.to_string(),
            }),
        }
    }

    /// Symbol used in configuration.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Multiply => "*",
        }
    }

    fn apply(self, acc: f64, weighted: f64) -> f64 {
        match self {
            Self::Add => acc + weighted,
            Self::Multiply => acc * weighted,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Configuration entry of one module in the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSpec {
    /// Module name, e.g. `"coauthors"`.
    pub name: String,
    /// Weight applied to the module's score.
    pub weight: f64,
    /// `"+"` or `"*"`.
    #[serde(default = "default_operator")]
    pub operator: String,
}

fn default_operator() -> String {
    "+".to_string()
}

impl ModuleSpec {
    /// Creates an entry.
    #[must_use]
    pub fn new(name: impl Into<String>, weight: f64, operator: Operator) -> Self {
        Self {
            name: name.into(),
            weight,
            operator: operator.symbol().to_string(),
        }
    }

    /// The default chain: coauthors (0.6, `+`) then affiliation (0.4, `+`).
    #[must_use]
    pub fn default_chain() -> Vec<Self> {
        vec![
            Self::new("coauthors", 0.6, Operator::Add),
            Self::new("affiliation", 0.4, Operator::Add),
        ]
    }
}

/// Features of one signature, aligned with the registry's chain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Features(Vec<FeatureSnapshot>);

impl Features {
    /// Returns true if no module observed anything.
    #[must_use]
    pub fn is_absent(&self) -> bool {
        self.0.iter().all(|f| matches!(f, FeatureSnapshot::Absent))
    }

    /// Per-module snapshots in chain order.
    #[must_use]
    pub fn snapshots(&self) -> &[FeatureSnapshot] {
        &self.0
    }
}

#[derive(Debug)]
struct Entry {
    module: Box<dyn ComparisonModule>,
    weight: f64,
    operator: Operator,
}

/// Ordered chain of comparison modules.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    entries: Vec<Entry>,
}

impl ModuleRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the chain from configuration, checking every entry.
    ///
    /// # Errors
    /// Any [`ConfigurationError`] raised by [`Self::register`], unknown
    /// module names, or an empty chain.
    pub fn from_specs(specs: &[ModuleSpec], coauthor_cap: usize) -> Result<Self, ConfigurationError> {
        if specs.is_empty() {
            return Err(ConfigurationError::EmptyChain);
        }
        let mut registry = Self::new();
        for spec in specs {
            let module: Box<dyn ComparisonModule> = match spec.name.trim() {
                "coauthors" => Box::new(CoauthorModule::new(coauthor_cap)),
                "affiliation" => Box::new(AffiliationModule),
                other => {
                    return Err(ConfigurationError::UnknownModule {
                        name: other.to_string(),
                    })
                }
            };
            let operator = Operator::parse(&spec.name, &spec.operator)?;
            registry.register(module, spec.weight, operator)?;
        }
        Ok(registry)
    }

    /// Appends a module to the chain.
    ///
    /// # Errors
    /// - `DuplicateModule` if a module with the same name is registered
    /// - `InvalidWeight` for non-finite or non-positive weights
    /// - `MultiplicativeHead` if the first module uses `*`
    pub fn register(
        &mut self,
        module: Box<dyn ComparisonModule>,
        weight: f64,
        operator: Operator,
    ) -> Result<(), ConfigurationError> {
        let name = module.name();
        if self.entries.iter().any(|e| e.module.name() == name) {
            return Err(ConfigurationError::DuplicateModule {
                name: name.to_string(),
            });
        }
        if !weight.is_finite() || weight <= 0.0 {
            return Err(ConfigurationError::InvalidWeight {
                name: name.to_string(),
                weight,
            });
        }
        if self.entries.is_empty() && operator == Operator::Multiply {
            return Err(ConfigurationError::MultiplicativeHead {
                name: name.to_string(),
            });
        }
        self.entries.push(Entry {
            module,
            weight,
            operator,
        });
        Ok(())
    }

    /// Number of modules in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Module names in chain order.
    #[must_use]
    pub fn module_names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|e| e.module.name()).collect()
    }

    /// Extracts every module's feature for `subject`.
    #[must_use]
    pub fn extract(&self, view: &RecordView, subject: &FieldRef) -> Features {
        Features(
            self.entries
                .iter()
                .map(|e| e.module.extract(view, subject))
                .collect(),
        )
    }

    /// Folds the weighted module scores of two signatures into `[0, 1]`.
    #[must_use]
    pub fn combine(&self, a: &Features, b: &Features) -> f64 {
        let mut acc = 0.0;
        for (i, entry) in self.entries.iter().enumerate() {
            let score = match (a.0.get(i), b.0.get(i)) {
                (Some(x), Some(y)) => entry.module.compare(x, y),
                _ => 0.0,
            };
            let score = if score.is_finite() { score.clamp(0.0, 1.0) } else { 0.0 };
            acc = entry.operator.apply(acc, entry.weight * score);
        }
        acc.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Fixed(&'static str, f64);

    impl ComparisonModule for Fixed {
        fn name(&self) -> &'static str {
            self.0
        }

        fn extract(&self, _view: &RecordView, _subject: &FieldRef) -> FeatureSnapshot {
            FeatureSnapshot::Absent
        }

        fn compare(&self, _a: &FeatureSnapshot, _b: &FeatureSnapshot) -> f64 {
            self.1
        }
    }

    fn features(n: usize) -> Features {
        Features(vec![FeatureSnapshot::Absent; n])
    }

    #[test]
    fn test_default_chain_builds() {
        let registry = ModuleRegistry::from_specs(&ModuleSpec::default_chain(), DEFAULT_COAUTHOR_CAP).unwrap();
        assert_eq!(registry.module_names(), vec!["coauthors", "affiliation"]);
    }

    #[test]
    fn test_unknown_module_fails_fast() {
        let specs = vec![ModuleSpec::new("horoscope", 1.0, Operator::Add)];
        assert!(matches!(
            ModuleRegistry::from_specs(&specs, 50),
            Err(ConfigurationError::UnknownModule { .. })
        ));
    }

    #[test]
    fn test_invalid_chains_are_rejected() {
        assert!(matches!(
            ModuleRegistry::from_specs(&[], 50),
            Err(ConfigurationError::EmptyChain)
        ));

        let bad_op = vec![ModuleSpec {
            name: "coauthors".to_string(),
            weight: 1.0,
            operator: "^".to_string(),
        }];
        assert!(matches!(
            ModuleRegistry::from_specs(&bad_op, 50),
            Err(ConfigurationError::UnknownOperator { .. })
        ));

        let nan = vec![ModuleSpec::new("coauthors", f64::NAN, Operator::Add)];
        assert!(matches!(
            ModuleRegistry::from_specs(&nan, 50),
            Err(ConfigurationError::InvalidWeight { .. })
        ));

        let dup = vec![
            ModuleSpec::new("coauthors", 0.5, Operator::Add),
            ModuleSpec::new("coauthors", 0.5, Operator::Add),
        ];
        assert!(matches!(
            ModuleRegistry::from_specs(&dup, 50),
            Err(ConfigurationError::DuplicateModule { .. })
        ));

        let head = vec![ModuleSpec::new("affiliation", 1.0, Operator::Multiply)];
        assert!(matches!(
            ModuleRegistry::from_specs(&head, 50),
            Err(ConfigurationError::MultiplicativeHead { .. })
        ));
    }

    #[test]
    fn test_fold_adds_and_multiplies_in_order() {
        let mut registry = ModuleRegistry::new();
        registry.register(Box::new(Fixed("a", 0.5)), 1.0, Operator::Add).unwrap();
        registry.register(Box::new(Fixed("b", 0.5)), 0.4, Operator::Add).unwrap();
        registry.register(Box::new(Fixed("c", 1.0)), 0.5, Operator::Multiply).unwrap();

        // (0.5 + 0.2) * 0.5
        let score = registry.combine(&features(3), &features(3));
        assert!((score - 0.35).abs() < 1e-12);
    }

    #[test]
    fn test_fold_clamps_and_ignores_bad_scores() {
        let mut registry = ModuleRegistry::new();
        registry.register(Box::new(Fixed("a", 1.0)), 2.0, Operator::Add).unwrap();
        assert_eq!(registry.combine(&features(1), &features(1)), 1.0);

        let mut registry = ModuleRegistry::new();
        registry.register(Box::new(Fixed("nan", f64::NAN)), 1.0, Operator::Add).unwrap();
        assert_eq!(registry.combine(&features(1), &features(1)), 0.0);
    }

    #[test]
    fn test_absent_features_contribute_zero() {
        let registry = ModuleRegistry::from_specs(&ModuleSpec::default_chain(), 50).unwrap();
        let view = RecordView {
            record: 1,
            fields: vec![FieldOccurrence::new(FieldRef::new(100, 1), "Smith, J.")],
            collaboration: None,
            date: None,
        };
        let f = registry.extract(&view, &FieldRef::new(100, 1));
        assert!(f.is_absent());
        assert_eq!(registry.combine(&f, &f), 0.0);
    }

    #[test]
    fn test_combined_evidence() {
        let registry = ModuleRegistry::from_specs(&ModuleSpec::default_chain(), 50).unwrap();
        let subject = FieldRef::new(100, 1);
        let make = |coauthor: &str| RecordView {
            record: 1,
            fields: vec![
                FieldOccurrence::new(subject, "Smith, J.").with_affiliation("CERN"),
                FieldOccurrence::new(FieldRef::new(700, 2), coauthor),
            ],
            collaboration: None,
            date: Some(ObservationDate::new(2010, 1)),
        };
        let a = registry.extract(&make("Doe, A."), &subject);
        let b = registry.extract(&make("Doe, A."), &subject);
        let c = registry.extract(&make("Roe, B."), &subject);

        let same = registry.combine(&a, &b);
        let different = registry.combine(&a, &c);
        let expected_same = 0.6 * certainty(1) + 0.4;
        assert!((same - expected_same).abs() < 1e-12, "got {same}");
        assert!((different - 0.4).abs() < 1e-12, "got {different}");
    }
}
