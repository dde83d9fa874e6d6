//! Engine configuration.
//!
//! Loaded from JSON; every field has a default so an empty object is a valid
//! configuration. [`RabbitConfig::validate`] checks everything eagerly so a
//! bad chain or threshold fails the job before any record is touched.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::compare::{ModuleRegistry, ModuleSpec, DEFAULT_COAUTHOR_CAP};
use crate::error::ConfigurationError;
use crate::names::NameFunction;

/// Configuration of the reconciliation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RabbitConfig {
    /// Stage A name similarity a rename must exceed.
    pub rename_threshold: f64,
    /// Coauthor count above which coauthor lists are hashed.
    pub coauthor_cap: usize,
    /// Ordered comparison chain.
    pub modules: Vec<ModuleSpec>,
    /// Fallback name functions tried after the exact matchable name.
    pub fallback_name_functions: Vec<String>,
    /// Whether external author ids take precedence over names.
    pub external_id_matching: bool,
    /// Where pairwise score caches are persisted; in-memory only if unset.
    pub cache_dir: Option<PathBuf>,
    /// Emit a progress report every this many records.
    pub progress_interval: usize,
}

impl Default for RabbitConfig {
    fn default() -> Self {
        Self {
            rename_threshold: 0.8,
            coauthor_cap: DEFAULT_COAUTHOR_CAP,
            modules: ModuleSpec::default_chain(),
            fallback_name_functions: NameFunction::ALL.iter().map(|f| f.as_str().to_string()).collect(),
            external_id_matching: true,
            cache_dir: None,
            progress_interval: 100,
        }
    }
}

impl RabbitConfig {
    /// Parses a JSON configuration.
    ///
    /// # Errors
    /// `Unreadable` for malformed JSON or unknown fields.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigurationError> {
        serde_json::from_str(json).map_err(|e| ConfigurationError::Unreadable {
            message: e.to_string(),
        })
    }

    /// Reads and parses a JSON configuration file.
    ///
    /// # Errors
    /// `Unreadable` if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|e| ConfigurationError::Unreadable {
            message: format!("{}: {e}", path.display()),
        })?;
        Self::from_json_str(&json)
    }

    /// Checks every setting.
    ///
    /// # Errors
    /// The first [`ConfigurationError`] found.
    pub fn validate(self) -> Result<Self, ConfigurationError> {
        self.into_parts().map(|(config, _, _)| config)
    }

    /// Validates and returns the configuration together with the comparison
    /// chain and fallback name functions it describes, each built once.
    ///
    /// # Errors
    /// The first [`ConfigurationError`] found.
    pub fn into_parts(self) -> Result<(Self, ModuleRegistry, Vec<NameFunction>), ConfigurationError> {
        if !(self.rename_threshold.is_finite() && (0.0..1.0).contains(&self.rename_threshold)) {
            return Err(ConfigurationError::InvalidValue {
                field: "rename_threshold".to_string(),
                reason: format!("must be in [0, 1), got {}", self.rename_threshold),
            });
        }
        if self.coauthor_cap == 0 {
            return Err(ConfigurationError::InvalidValue {
                field: "coauthor_cap".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.progress_interval == 0 {
            return Err(ConfigurationError::InvalidValue {
                field: "progress_interval".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        let name_functions = self.name_functions()?;
        let registry = self.registry()?;
        Ok((self, registry, name_functions))
    }

    /// Parsed fallback name functions, in configured order.
    ///
    /// # Errors
    /// `UnknownNameFunction` for unrecognized names.
    pub fn name_functions(&self) -> Result<Vec<NameFunction>, ConfigurationError> {
        self.fallback_name_functions
            .iter()
            .map(|name| {
                NameFunction::try_from(name.clone())
                    .map_err(|_| ConfigurationError::UnknownNameFunction { name: name.clone() })
            })
            .collect()
    }

    /// Builds the comparison chain.
    ///
    /// # Errors
    /// Any chain configuration error.
    pub fn registry(&self) -> Result<ModuleRegistry, ConfigurationError> {
        ModuleRegistry::from_specs(&self.modules, self.coauthor_cap)
    }
}
