//! # authorid - Incremental Author Identity Resolution
//!
//! authorid keeps a durable mapping from author-name occurrences on
//! bibliographic records ("signatures") to real-world author identities, and
//! updates it incrementally as records are created, modified or deleted.
//!
//! ## Core Concepts
//!
//! - **Signature**: one author name on one record, keyed by field and record
//! - **Identity**: a persisted cluster of signatures believed to denote one author
//! - **Matchable name**: normalized name used as a fast equality key
//! - **Rabbit**: the batch engine reconciling changed records with identities
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use authorid::{BatchControl, Rabbit, RabbitConfig};
//! use authorid::storage::{InMemoryIdentityStore, InMemoryMetadataSource};
//!
//! let metadata = Arc::new(InMemoryMetadataSource::new());
//! let identities = Arc::new(InMemoryIdentityStore::new());
//! let rabbit = Rabbit::new(RabbitConfig::default(), metadata, identities)?;
//!
//! let log = rabbit.run_batch([1, 2, 3], &BatchControl::new())?;
//! println!("created {} identities", log.created.len());
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Core types
pub mod error;
pub mod identity;
pub mod names;
pub mod signature;

// Scoring
pub mod assignment;
pub mod cache;
pub mod compare;

// Storage, configuration and the engine
pub mod atomic_file;
pub mod config;
pub mod rabbit;
pub mod storage;

// Re-export primary types at crate root for convenience
pub use assignment::{accepted_matches, maximum_matching, Match};
pub use cache::{PairScore, PairwiseScores, ScoreCacheStore};
pub use compare::{ComparisonModule, ModuleRegistry, ModuleSpec, ObservationDate, Operator, RecordView};
pub use config::RabbitConfig;
pub use error::{AuthorIdError, AuthorIdResult, ConfigurationError, ExecutionError, ValidationError};
pub use identity::{Identity, IdentityId};
pub use names::{compare_names, create_matchable_name, NameFunction};
pub use rabbit::{BatchControl, BatchStatus, ChangeLog, ChannelMonitor, LogMonitor, Progress, ProgressMonitor, Rabbit};
pub use signature::{AssignmentStatus, FieldOccurrence, FieldRef, RecordId, Signature, SignatureKey};
pub use storage::{IdentityStore, MetadataSource, RecordPlan, StorageError};
