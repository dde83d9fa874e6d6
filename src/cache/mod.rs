//! Pairwise score cache.
//!
//! Stores one score per unordered pair of signatures inside a cluster (all
//! signatures sharing a last-name cluster key) in a packed triangular array:
//!
//! ```text
//! offset(i, j) = i + j(j+1)/2      for i <= j
//!
//!        j=0  j=1  j=2  j=3
//! i=0  [  0    1    3    6 ]
//! i=1  [       2    4    7 ]
//! i=2  [            5    8 ]
//! i=3  [                 9 ]
//! ```
//!
//! Column-major packing means a new member only appends `n + 1` slots, so a
//! cluster can grow during a batch without repacking.
//!
//! Three negative sentinels distinguish "never computed", "forced match" and
//! "forced no-match" from real scores in `[0, 1]`.

mod codec;
mod store;

use std::collections::HashMap;

use crate::error::ValidationError;
use crate::signature::SignatureKey;

pub use codec::{decode, encode, CACHE_VERSION, MAGIC};
pub use store::ScoreCacheStore;

/// Encoded value of a pair that was never computed.
pub const UNKNOWN: f32 = -3.0;
/// Encoded value of a pair a human declared to be the same author.
pub const FORCED_MATCH: f32 = -2.0;
/// Encoded value of a pair a human declared to be different authors.
pub const FORCED_NO_MATCH: f32 = -1.0;

/// A cached pair score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PairScore {
    /// Never computed.
    Unknown,
    /// Pinned to "same author".
    ForcedMatch,
    /// Pinned to "different authors".
    ForcedNoMatch,
    /// Computed similarity in `[0, 1]`.
    Value(f32),
}

impl PairScore {
    /// Encodes the score into its stored float.
    #[must_use]
    pub fn encode(self) -> f32 {
        match self {
            Self::Unknown => UNKNOWN,
            Self::ForcedMatch => FORCED_MATCH,
            Self::ForcedNoMatch => FORCED_NO_MATCH,
            Self::Value(v) => v,
        }
    }

    /// Decodes a stored float. Anything that is neither a sentinel nor a
    /// valid score reads back as `Unknown` and gets recomputed.
    #[must_use]
    pub fn decode(raw: f32) -> Self {
        if raw == FORCED_MATCH {
            Self::ForcedMatch
        } else if raw == FORCED_NO_MATCH {
            Self::ForcedNoMatch
        } else if (0.0..=1.0).contains(&raw) {
            Self::Value(raw)
        } else {
            Self::Unknown
        }
    }

    /// Returns true unless the pair was never computed.
    #[must_use]
    pub const fn is_known(self) -> bool {
        !matches!(self, Self::Unknown)
    }

    /// Collapses the score to a probability; forced values map to 1 and 0.
    #[must_use]
    pub fn as_probability(self) -> Option<f64> {
        match self {
            Self::Unknown => None,
            Self::ForcedMatch => Some(1.0),
            Self::ForcedNoMatch => Some(0.0),
            Self::Value(v) => Some(f64::from(v)),
        }
    }
}

/// Packed offset of the unordered pair `(i, j)`.
#[inline]
#[must_use]
pub const fn packed_offset(i: usize, j: usize) -> usize {
    let (lo, hi) = if i <= j { (i, j) } else { (j, i) };
    lo + hi * (hi + 1) / 2
}

/// Number of packed slots for `n` dense indices.
#[inline]
#[must_use]
pub const fn packed_len(n: usize) -> usize {
    n * (n + 1) / 2
}

/// Pair scores of one cluster.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PairwiseScores {
    index: HashMap<SignatureKey, usize>,
    packed: Vec<f32>,
    slots: usize,
}

impl PairwiseScores {
    /// Creates an empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a cluster over `members`, assigning dense indices in key order.
    #[must_use]
    pub fn open<I>(members: I) -> Self
    where
        I: IntoIterator<Item = SignatureKey>,
    {
        let mut keys: Vec<SignatureKey> = members.into_iter().collect();
        keys.sort();
        keys.dedup();

        let slots = keys.len();
        let index = keys.into_iter().enumerate().map(|(i, k)| (k, i)).collect();
        Self {
            index,
            packed: vec![UNKNOWN; packed_len(slots)],
            slots,
        }
    }

    /// Number of live members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Returns true if the cluster has no live members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Number of allocated dense indices, including removed members.
    #[must_use]
    pub const fn slots(&self) -> usize {
        self.slots
    }

    /// Dense indices no longer owned by any member.
    #[must_use]
    pub fn dead_slots(&self) -> usize {
        self.slots - self.index.len()
    }

    /// Returns true if `key` is a live member.
    #[must_use]
    pub fn contains(&self, key: &SignatureKey) -> bool {
        self.index.contains_key(key)
    }

    /// Live members in key order.
    #[must_use]
    pub fn members(&self) -> Vec<SignatureKey> {
        let mut keys: Vec<SignatureKey> = self.index.keys().copied().collect();
        keys.sort();
        keys
    }

    /// Dense index of a member.
    #[must_use]
    pub fn index_of(&self, key: &SignatureKey) -> Option<usize> {
        self.index.get(key).copied()
    }

    fn require(&self, key: &SignatureKey) -> Result<usize, ValidationError> {
        self.index_of(key)
            .ok_or(ValidationError::UnknownMember { key: *key })
    }

    /// Adds a member at the next dense index.
    ///
    /// # Errors
    /// `DuplicateMember` if `key` is already live.
    pub fn insert_member(&mut self, key: SignatureKey) -> Result<usize, ValidationError> {
        if self.index.contains_key(&key) {
            return Err(ValidationError::DuplicateMember { key });
        }
        Ok(self.push_member(key))
    }

    /// Adds `key` if missing and returns its dense index.
    pub fn ensure_member(&mut self, key: SignatureKey) -> usize {
        match self.index_of(&key) {
            Some(idx) => idx,
            None => self.push_member(key),
        }
    }

    fn push_member(&mut self, key: SignatureKey) -> usize {
        let idx = self.slots;
        self.slots += 1;
        self.packed.resize(packed_len(self.slots), UNKNOWN);
        self.index.insert(key, idx);
        idx
    }

    /// Drops a member. Its slots stay allocated until [`Self::compact`].
    pub fn remove_member(&mut self, key: &SignatureKey) -> bool {
        let Some(idx) = self.index.remove(key) else {
            return false;
        };
        for other in 0..self.slots {
            self.packed[packed_offset(idx, other)] = UNKNOWN;
        }
        true
    }

    /// Resets the computed scores of `key` to unknown. Forced values are
    /// human decisions and survive. Returns the number of cells reset.
    pub fn forget_computed(&mut self, key: &SignatureKey) -> usize {
        let Some(idx) = self.index_of(key) else {
            return 0;
        };
        let mut reset = 0;
        for other in 0..self.slots {
            let cell = &mut self.packed[packed_offset(idx, other)];
            if matches!(PairScore::decode(*cell), PairScore::Value(_)) {
                *cell = UNKNOWN;
                reset += 1;
            }
        }
        reset
    }

    /// Moves the scores of `old` to `new` (a renamed author field).
    ///
    /// # Errors
    /// `UnknownMember` if `old` is not live, `DuplicateMember` if `new` is.
    pub fn rename_member(&mut self, old: &SignatureKey, new: SignatureKey) -> Result<(), ValidationError> {
        if old == &new {
            return Ok(());
        }
        if self.index.contains_key(&new) {
            return Err(ValidationError::DuplicateMember { key: new });
        }
        let idx = self
            .index
            .remove(old)
            .ok_or(ValidationError::UnknownMember { key: *old })?;
        self.index.insert(new, idx);
        Ok(())
    }

    /// Reads the score of an unordered pair.
    ///
    /// # Errors
    /// `UnknownMember` if either key is not live.
    pub fn get(&self, a: &SignatureKey, b: &SignatureKey) -> Result<PairScore, ValidationError> {
        let i = self.require(a)?;
        let j = self.require(b)?;
        Ok(PairScore::decode(self.packed[packed_offset(i, j)]))
    }

    /// Writes the score of an unordered pair.
    ///
    /// # Errors
    /// `UnknownMember` for non-members, `ScoreOutOfRange` for values outside `[0, 1]`.
    pub fn set(&mut self, a: &SignatureKey, b: &SignatureKey, score: PairScore) -> Result<(), ValidationError> {
        if let PairScore::Value(v) = score {
            if !(0.0..=1.0).contains(&v) {
                return Err(ValidationError::ScoreOutOfRange { value: f64::from(v) });
            }
        }
        let i = self.require(a)?;
        let j = self.require(b)?;
        self.packed[packed_offset(i, j)] = score.encode();
        Ok(())
    }

    /// Re-assigns dense indices in key order and drops dead slots.
    pub fn compact(&mut self) {
        if self.dead_slots() == 0 {
            return;
        }
        let members = self.members();
        let mut packed = vec![UNKNOWN; packed_len(members.len())];
        for (j, b) in members.iter().enumerate() {
            let old_j = self.index[b];
            for (i, a) in members.iter().enumerate().take(j + 1) {
                let old_i = self.index[a];
                packed[packed_offset(i, j)] = self.packed[packed_offset(old_i, old_j)];
            }
        }
        self.index = members.into_iter().enumerate().map(|(i, k)| (k, i)).collect();
        self.slots = self.index.len();
        self.packed = packed;
    }

    /// Returns true if more than half of the allocated indices are dead.
    #[must_use]
    pub fn needs_compaction(&self) -> bool {
        self.dead_slots() * 2 > self.slots
    }
}
