//! Score cache persistence across batches.

use std::fs;
use std::sync::Arc;

use tempfile::tempdir;

use authorid::storage::{InMemoryIdentityStore, InMemoryMetadataSource, RecordMetadata};
use authorid::{
    BatchControl, FieldOccurrence, FieldRef, IdentityStore, PairScore, Rabbit, RabbitConfig, RecordId,
    ScoreCacheStore, SignatureKey,
};

fn author(value: u64, name: &str) -> FieldOccurrence {
    FieldOccurrence::new(FieldRef::new(100, value), name)
}

fn key(value: u64, record: RecordId) -> SignatureKey {
    SignatureKey::new(FieldRef::new(100, value), record)
}

fn engine(
    metadata: &Arc<InMemoryMetadataSource>,
    store: &Arc<InMemoryIdentityStore>,
    cache_dir: &std::path::Path,
) -> Rabbit {
    let config = RabbitConfig {
        cache_dir: Some(cache_dir.to_path_buf()),
        ..RabbitConfig::default()
    };
    Rabbit::new(config, metadata.clone(), store.clone()).unwrap()
}

#[test]
fn test_forced_match_steers_ranking_and_is_kept() {
    let dir = tempdir().unwrap();
    let metadata = Arc::new(InMemoryMetadataSource::new());
    let store = Arc::new(InMemoryIdentityStore::new());

    // Two homonyms on one record end up in two identities.
    metadata
        .upsert_record(1, RecordMetadata::new(vec![author(1, "Smith, J."), author(2, "Smith, J.")]))
        .unwrap();
    engine(&metadata, &store, dir.path())
        .run_batch([1], &BatchControl::new())
        .unwrap();
    let first = store.owner_of(&key(1, 1)).unwrap().unwrap().0;
    let second = store.owner_of(&key(2, 1)).unwrap().unwrap().0;
    assert!(first < second);

    // A curator forces the next signature onto the second identity.
    let disk = ScoreCacheStore::open(dir.path()).unwrap();
    let mut scores = disk.load("smith");
    scores.ensure_member(key(1, 2));
    scores.ensure_member(key(2, 1));
    scores.set(&key(1, 2), &key(2, 1), PairScore::ForcedMatch).unwrap();
    disk.save("smith", &mut scores).unwrap();

    metadata
        .upsert_record(2, RecordMetadata::new(vec![author(1, "Smith, J.")]))
        .unwrap();
    engine(&metadata, &store, dir.path())
        .run_batch([2], &BatchControl::new())
        .unwrap();
    assert_eq!(store.owner_of(&key(1, 2)).unwrap().unwrap().0, second);

    let scores = disk.load("smith");
    assert_eq!(scores.get(&key(1, 2), &key(2, 1)).unwrap(), PairScore::ForcedMatch);
    assert_eq!(scores.get(&key(1, 2), &key(1, 1)).unwrap(), PairScore::Value(0.0));
}

#[test]
fn test_deleted_signatures_leave_the_cache() {
    let dir = tempdir().unwrap();
    let metadata = Arc::new(InMemoryMetadataSource::new());
    let store = Arc::new(InMemoryIdentityStore::new());
    let disk = ScoreCacheStore::open(dir.path()).unwrap();

    metadata
        .upsert_record(1, RecordMetadata::new(vec![author(1, "Smith, J.")]))
        .unwrap();
    let mut scores = disk.load("smith");
    scores.ensure_member(key(1, 1));
    scores.ensure_member(key(1, 9));
    scores.set(&key(1, 1), &key(1, 9), PairScore::ForcedNoMatch).unwrap();
    disk.save("smith", &mut scores).unwrap();

    engine(&metadata, &store, dir.path())
        .run_batch([1], &BatchControl::new())
        .unwrap();
    assert!(disk.load("smith").contains(&key(1, 1)));

    metadata.delete_record(1).unwrap();
    engine(&metadata, &store, dir.path())
        .run_batch(Vec::new(), &BatchControl::new())
        .unwrap();
    let scores = disk.load("smith");
    assert!(!scores.contains(&key(1, 1)));
    assert!(scores.contains(&key(1, 9)));
}

#[test]
fn test_corrupt_cache_is_rebuilt() {
    let dir = tempdir().unwrap();
    let metadata = Arc::new(InMemoryMetadataSource::new());
    let store = Arc::new(InMemoryIdentityStore::new());
    let disk = ScoreCacheStore::open(dir.path()).unwrap();
    fs::write(disk.path_for("smith"), b"PSCA not really a cache").unwrap();
    assert!(disk.try_load("smith").is_err());

    metadata
        .upsert_record(1, RecordMetadata::new(vec![author(1, "Smith, J.")]))
        .unwrap();
    let log = engine(&metadata, &store, dir.path())
        .run_batch([1], &BatchControl::new())
        .unwrap();
    assert_eq!(log.created.len(), 1);
    assert!(log.skipped_records.is_empty());

    assert!(disk.try_load("smith").unwrap().is_some());
}

#[test]
fn test_unusable_cache_dir_is_a_configuration_error() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("not-a-dir");
    fs::write(&file, b"").unwrap();

    let config = RabbitConfig {
        cache_dir: Some(file),
        ..RabbitConfig::default()
    };
    let err = Rabbit::new(
        config,
        Arc::new(InMemoryMetadataSource::new()),
        Arc::new(InMemoryIdentityStore::new()),
    )
    .unwrap_err();
    assert!(err.is_configuration());
}
