//! On-disk home of per-cluster score caches.
//!
//! One file per cluster. Files are written to a temporary sibling, fsynced,
//! then atomically renamed over the final path, so a reader never observes a
//! partially written cache. Unreadable files load as empty caches.

use std::fs;
use std::io::{ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::{codec, PairwiseScores};
use crate::atomic_file::{write_atomically, TEMP_EXTENSION};

const CACHE_EXTENSION: &str = "psc";

/// Directory of persisted score caches.
#[derive(Debug, Clone)]
pub struct ScoreCacheStore {
    dir: PathBuf,
}

impl ScoreCacheStore {
    /// Opens (creating if needed) a cache directory and removes temp files
    /// left behind by interrupted writes.
    ///
    /// # Errors
    /// Fails if the directory cannot be created or listed.
    pub fn open(dir: impl AsRef<Path>) -> IoResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == TEMP_EXTENSION) {
                debug!(path = %path.display(), "removing stale score cache temp file");
                let _ = fs::remove_file(&path);
            }
        }

        Ok(Self { dir })
    }

    /// Directory holding the cache files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File path used for `cluster`.
    ///
    /// Cluster keys are free text, so the file name carries a readable
    /// prefix plus a blake3 digest of the full key.
    #[must_use]
    pub fn path_for(&self, cluster: &str) -> PathBuf {
        let readable: String = cluster
            .chars()
            .filter(char::is_ascii_alphanumeric)
            .take(32)
            .collect();
        let digest = blake3::hash(cluster.as_bytes()).to_hex();
        self.dir
            .join(format!("{readable}-{}.{CACHE_EXTENSION}", &digest.as_str()[..16]))
    }

    /// Loads a cluster, or `None` if it was never saved.
    ///
    /// # Errors
    /// Propagates I/O and decoding failures.
    pub fn try_load(&self, cluster: &str) -> IoResult<Option<PairwiseScores>> {
        match fs::read(self.path_for(cluster)) {
            Ok(bytes) => codec::decode(&bytes).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Loads a cluster; missing or corrupted files yield an empty cache.
    #[must_use]
    pub fn load(&self, cluster: &str) -> PairwiseScores {
        match self.try_load(cluster) {
            Ok(Some(scores)) => scores,
            Ok(None) => PairwiseScores::new(),
            Err(e) => {
                warn!(cluster, error = %e, "score cache unreadable, starting empty");
                PairwiseScores::new()
            }
        }
    }

    /// Persists a cluster atomically, compacting it first if most of its
    /// slots are dead.
    ///
    /// # Errors
    /// Propagates I/O failures; the previous file (if any) is left intact.
    pub fn save(&self, cluster: &str, scores: &mut PairwiseScores) -> IoResult<()> {
        if scores.needs_compaction() {
            scores.compact();
        }
        let bytes = codec::encode(scores)?;
        write_atomically(self.path_for(cluster), &bytes)
    }

    /// Deletes the file of a cluster, if present.
    ///
    /// # Errors
    /// Propagates I/O failures other than "not found".
    pub fn remove(&self, cluster: &str) -> IoResult<()> {
        match fs::remove_file(self.path_for(cluster)) {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::PairScore;
    use crate::signature::{FieldRef, SignatureKey};
    use tempfile::tempdir;

    fn key(value: u64, record: u64) -> SignatureKey {
        SignatureKey::new(FieldRef::new(100, value), record)
    }

    #[test]
    fn test_missing_cluster_loads_empty() {
        let dir = tempdir().unwrap();
        let store = ScoreCacheStore::open(dir.path()).unwrap();
        assert!(store.try_load("smith").unwrap().is_none());
        assert!(store.load("smith").is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let store = ScoreCacheStore::open(dir.path()).unwrap();

        let (a, b) = (key(1, 1), key(1, 2));
        let mut scores = PairwiseScores::open([a, b]);
        scores.set(&a, &b, PairScore::Value(0.6)).unwrap();
        store.save("smith", &mut scores).unwrap();

        let loaded = store.load("smith");
        assert_eq!(loaded.get(&a, &b).unwrap(), PairScore::Value(0.6));
        assert!(store.load("jones").is_empty());
    }

    #[test]
    fn test_corrupted_file_loads_empty() {
        let dir = tempdir().unwrap();
        let store = ScoreCacheStore::open(dir.path()).unwrap();
        fs::write(store.path_for("smith"), b"not a cache").unwrap();

        assert!(store.try_load("smith").is_err());
        assert!(store.load("smith").is_empty());
    }

    #[test]
    fn test_no_temp_files_left_after_save() {
        let dir = tempdir().unwrap();
        let store = ScoreCacheStore::open(dir.path()).unwrap();
        let mut scores = PairwiseScores::open([key(1, 1)]);
        store.save("smith", &mut scores).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|x| x == TEMP_EXTENSION))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_open_removes_stale_temp_files() {
        let dir = tempdir().unwrap();
        let stale = dir.path().join("smith-0000.psc.1234.tmp");
        fs::write(&stale, b"partial").unwrap();

        let _store = ScoreCacheStore::open(dir.path()).unwrap();
        assert!(!stale.exists());
    }

    #[test]
    fn test_path_for_distinguishes_similar_clusters() {
        let dir = tempdir().unwrap();
        let store = ScoreCacheStore::open(dir.path()).unwrap();
        assert_ne!(store.path_for("o'neil"), store.path_for("oneil"));
        assert!(store.path_for("smith").to_string_lossy().ends_with(".psc"));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = ScoreCacheStore::open(dir.path()).unwrap();
        let mut scores = PairwiseScores::new();
        store.save("smith", &mut scores).unwrap();
        store.remove("smith").unwrap();
        store.remove("smith").unwrap();
        assert!(store.try_load("smith").unwrap().is_none());
    }
}
