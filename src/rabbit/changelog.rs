//! Summary of one batch.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::IdentityId;
use crate::signature::{RecordId, SignatureKey};

/// How a batch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Every record was handled (skipped records included).
    Completed,
    /// A stop was requested before the last record.
    Stopped,
}

/// Everything a batch changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeLog {
    /// How the batch ended.
    pub status: BatchStatus,
    /// Batch start.
    pub started_at: DateTime<Utc>,
    /// Batch end, after identity recomputation.
    pub finished_at: DateTime<Utc>,
    /// Records handled, skipped ones included.
    pub processed_records: usize,
    /// Identities created.
    pub created: BTreeSet<IdentityId>,
    /// Identities whose signature set changed.
    pub touched: BTreeSet<IdentityId>,
    /// Identities deleted because they no longer own any signature.
    pub pruned: BTreeSet<IdentityId>,
    /// Signatures detached because their field or record disappeared.
    pub deleted_signatures: Vec<SignatureKey>,
    /// Ownership moved from the first key to the second.
    pub renamed_signatures: Vec<(SignatureKey, SignatureKey)>,
    /// Records left untouched because of an error.
    pub skipped_records: Vec<RecordId>,
    /// Signatures given a new identity because the name match already owned
    /// a signature on the same record.
    pub conflicts_resolved: usize,
}

impl ChangeLog {
    pub(crate) fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            status: BatchStatus::Completed,
            started_at,
            finished_at: started_at,
            processed_records: 0,
            created: BTreeSet::new(),
            touched: BTreeSet::new(),
            pruned: BTreeSet::new(),
            deleted_signatures: Vec::new(),
            renamed_signatures: Vec::new(),
            skipped_records: Vec::new(),
            conflicts_resolved: 0,
        }
    }

    /// Returns true if the batch changed no identity.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.touched.is_empty() && self.deleted_signatures.is_empty() && self.renamed_signatures.is_empty()
    }
}
