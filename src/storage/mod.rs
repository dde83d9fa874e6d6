//! Storage contracts for authorid.
//!
//! The traits describe what the engine needs from its collaborators; the
//! in-memory backend implements them for tests and the command-line runner.

mod memory;
mod traits;

pub use memory::{
    IdentitySnapshot, InMemoryIdentityStore, InMemoryMetadataSource, OwnedSignature, RecordMetadata,
    Rejection,
};
pub use traits::{IdentityStore, MetadataSource, RecordPlan, StorageError};
