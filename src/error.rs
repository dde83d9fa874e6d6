//! Error types for authorid.
//!
//! All errors are strongly typed using thiserror so callers can match on the
//! specific condition. Per-record failures inside a batch never reach the
//! caller; they are logged and counted in the change log instead.

use thiserror::Error;

use crate::identity::IdentityId;
use crate::signature::{RecordId, SignatureKey};

/// Validation errors that occur during input validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Score {value} is out of range [0.0, 1.0]")]
    ScoreOutOfRange {
        value: f64,
    },

    #[error("Similarity matrix row {row} has {actual} columns, expected {expected}")]
    RaggedMatrix {
        row: usize,
        actual: usize,
        expected: usize,
    },

    #[error("Signature {key} is not a member of this cluster")]
    UnknownMember {
        key: SignatureKey,
    },

    #[error("Signature {key} is already a member of this cluster")]
    DuplicateMember {
        key: SignatureKey,
    },
}

/// Configuration errors. These fail a job before any record is processed.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Unknown comparison module '{name}'")]
    UnknownModule {
        name: String,
    },

    #[error("Comparison module '{name}' appears more than once")]
    DuplicateModule {
        name: String,
    },

    #[error("Comparison module '{name}' has invalid weight {weight}")]
    InvalidWeight {
        name: String,
        weight: f64,
    },

    #[error("Unknown combination operator '{operator}' for module '{name}'")]
    UnknownOperator {
        name: String,
        operator: String,
    },

    #[error("Comparison chain must start with an additive module, got '{name}'")]
    MultiplicativeHead {
        name: String,
    },

    #[error("Comparison chain is empty")]
    EmptyChain,

    #[error("Unknown fallback name function '{name}'")]
    UnknownNameFunction {
        name: String,
    },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue {
        field: String,
        reason: String,
    },

    #[error("Failed to read configuration: {message}")]
    Unreadable {
        message: String,
    },
}

/// Execution errors that occur while reconciling records.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Record {record} disappeared during reconciliation")]
    RecordVanished {
        record: RecordId,
    },

    #[error("Signature {key} disappeared during reconciliation")]
    SignatureVanished {
        key: SignatureKey,
    },

    #[error("Identity {id} disappeared during reconciliation")]
    IdentityVanished {
        id: IdentityId,
    },

    #[error("Storage error: {message}")]
    Storage {
        message: String,
    },
}

/// Top-level error type for authorid.
#[derive(Debug, Error)]
pub enum AuthorIdError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl AuthorIdError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if the underlying data changed under the engine's feet.
    #[must_use]
    pub const fn is_data_inconsistency(&self) -> bool {
        matches!(
            self,
            Self::Execution(
                ExecutionError::RecordVanished { .. }
                    | ExecutionError::SignatureVanished { .. }
                    | ExecutionError::IdentityVanished { .. }
            )
        )
    }

    /// Returns true if re-running the same record later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) | Self::Configuration(_) | Self::Internal { .. } => false,
            Self::Execution(_) => true,
        }
    }
}

impl From<crate::storage::StorageError> for AuthorIdError {
    fn from(err: crate::storage::StorageError) -> Self {
        use crate::storage::StorageError;

        match err {
            StorageError::SignatureNotFound(key) => {
                Self::Execution(ExecutionError::SignatureVanished { key })
            }
            StorageError::IdentityNotFound(id) => {
                Self::Execution(ExecutionError::IdentityVanished { id })
            }
            other => Self::Execution(ExecutionError::Storage {
                message: other.to_string(),
            }),
        }
    }
}

/// Result type alias for authorid operations.
pub type AuthorIdResult<T> = Result<T, AuthorIdError>;
