//! Recovery from a process that stopped between writing one store and the
//! other. Each test builds the on-disk state such a stop leaves behind and
//! reopens the data directory.

mod common;

use std::fs;

use common::{axis, config_in, payload};
use docvault_core::metadata_store::MetadataStore;
use docvault_core::snapshot;
use docvault_core::{ConsistencyCoordinator, ConsistencyIssue, Error, VectorIndex, with_coordinator};

fn ids(hits: &[docvault_core::SearchHit]) -> Vec<&str> {
    hits.iter().map(|h| h.source_id.as_str()).collect()
}

/// "a" at slot 0 is deleted (tombstone), "b" lives at slot 1.
fn seed_with_tombstone(dir: &std::path::Path) {
    with_coordinator(config_in(dir, 2), |coord| {
        coord.insert_one(&payload("a", vec![axis(2, 0)]))?;
        coord.insert_one(&payload("b", vec![axis(2, 1)]))?;
        coord.delete_source("a")?;
        Ok(())
    })
    .unwrap();
}

#[test]
fn rows_past_the_index_end_refuse_writes() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), 2);
    with_coordinator(config.clone(), |coord| {
        coord.insert_one(&payload("a", vec![axis(2, 0)]))?;
        Ok(())
    })
    .unwrap();
    fs::remove_file(config.index_path()).unwrap();

    let coord = ConsistencyCoordinator::open(config).unwrap();
    let report = coord.audit_consistency().unwrap();
    assert!(report.issues.iter().any(ConsistencyIssue::blocks_writes));

    let err = coord.insert_one(&payload("b", vec![axis(2, 1)])).unwrap_err();
    assert!(matches!(err, Error::ConsistencyViolation(_)), "{err:?}");
    assert!(coord.chunks_for_source("b").unwrap().is_empty());
    assert!(matches!(coord.compact(), Err(Error::ConsistencyViolation(_))));
    assert!(coord.search(&axis(2, 1), 5).unwrap().is_empty());

    coord.clear_all().unwrap();
    coord.insert_one(&payload("b", vec![axis(2, 1)])).unwrap();
    assert_eq!(ids(&coord.search(&axis(2, 1), 1).unwrap()), vec!["b"]);
    assert!(coord.audit_consistency().unwrap().ok);
}

#[test]
fn vectors_without_rows_are_skipped_then_compacted() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), 2);
    with_coordinator(config.clone(), |coord| {
        coord.insert_one(&payload("a", vec![axis(2, 0)]))?;
        Ok(())
    })
    .unwrap();
    // Index rewritten for a batch whose rows never committed.
    let mut index = VectorIndex::load(&config.index_path()).unwrap();
    index.append(&[axis(2, 1)]).unwrap();
    index.save(&config.index_path()).unwrap();

    let coord = ConsistencyCoordinator::open(config).unwrap();
    let report = coord.audit_consistency().unwrap();
    assert!(!report.ok);
    assert!(matches!(
        report.issues.as_slice(),
        [ConsistencyIssue::UnaccountedSlots { count: 1, .. }]
    ));
    assert_eq!(ids(&coord.search(&axis(2, 1), 1).unwrap()), vec!["a"]);

    let outcome = coord.insert_one(&payload("b", vec![axis(2, 1)])).unwrap();
    assert_eq!(outcome.start_slot, 2);
    assert_eq!(ids(&coord.search(&axis(2, 1), 1).unwrap()), vec!["b"]);

    let compacted = coord.compact().unwrap();
    assert_eq!(compacted.removed_vectors, 1);
    assert_eq!(compacted.vector_count, 2);
    assert!(coord.audit_consistency().unwrap().ok);
    assert_eq!(ids(&coord.search(&axis(2, 1), 1).unwrap()), vec!["b"]);
}

#[test]
fn failed_index_write_rolls_back_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), 2);
    let coord = ConsistencyCoordinator::open(config.clone()).unwrap();
    coord.insert_one(&payload("a", vec![axis(2, 0)])).unwrap();

    let blocker = snapshot::temp_path(&config.index_path());
    fs::create_dir(&blocker).unwrap();
    let err = coord.insert_one(&payload("b", vec![axis(2, 1)])).unwrap_err();
    assert!(matches!(err, Error::SnapshotIo { .. }), "{err:?}");
    assert!(coord.chunks_for_source("b").unwrap().is_empty());
    assert_eq!(coord.stats().unwrap().vector_count, 1);
    assert!(coord.audit_consistency().unwrap().ok);

    fs::remove_dir(&blocker).unwrap();
    assert_eq!(coord.insert_one(&payload("b", vec![axis(2, 1)])).unwrap().start_slot, 1);
    coord.close().unwrap();

    let coord = ConsistencyCoordinator::open(config).unwrap();
    let report = coord.audit_consistency().unwrap();
    assert!(report.ok, "{:?}", report.issues);
    assert_eq!(report.vector_count, 2);
}

#[test]
fn committed_compaction_is_finished_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), 2);
    seed_with_tombstone(dir.path());
    let uncompacted = fs::read(config.index_path()).unwrap();

    with_coordinator(config.clone(), |coord| coord.compact().map(drop)).unwrap();
    // Stop after the renumbering committed but before the rename.
    let staged = snapshot::staged_path(&config.index_path());
    fs::rename(config.index_path(), &staged).unwrap();
    fs::write(config.index_path(), uncompacted).unwrap();
    MetadataStore::open(config.metadata_path())
        .unwrap()
        .mark_staged_index(1)
        .unwrap();

    let coord = ConsistencyCoordinator::open(config).unwrap();
    assert!(!staged.exists());
    let report = coord.audit_consistency().unwrap();
    assert!(report.ok, "{:?}", report.issues);
    assert_eq!(report.vector_count, 1);
    let hits = coord.search(&axis(2, 1), 1).unwrap();
    assert_eq!(ids(&hits), vec!["b"]);
    assert_eq!(hits[0].slot, 0);
    assert_eq!(hits[0].distance, 0.0);
}

#[test]
fn uncommitted_compaction_is_discarded_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), 2);
    seed_with_tombstone(dir.path());
    let staged = snapshot::staged_path(&config.index_path());
    fs::write(&staged, b"half-written").unwrap();

    let coord = ConsistencyCoordinator::open(config).unwrap();
    assert!(!staged.exists());
    let report = coord.audit_consistency().unwrap();
    assert!(report.ok, "{:?}", report.issues);
    assert_eq!(report.vector_count, 2);
    assert_eq!(report.tombstone_count, 1);
    assert_eq!(ids(&coord.search(&axis(2, 1), 1).unwrap()), vec!["b"]);
}

#[test]
fn failed_staging_leaves_compaction_undone() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), 2);
    seed_with_tombstone(dir.path());
    let coord = ConsistencyCoordinator::open(config.clone()).unwrap();
    let before = coord.audit_consistency().unwrap();

    let staged = snapshot::staged_path(&config.index_path());
    let blocker = snapshot::temp_path(&staged);
    fs::create_dir(&blocker).unwrap();
    assert!(coord.compact().is_err());
    assert_eq!(coord.audit_consistency().unwrap(), before);
    assert!(!staged.exists());

    fs::remove_dir(&blocker).unwrap();
    assert_eq!(coord.compact().unwrap().removed_vectors, 1);
    assert!(!staged.exists());
    assert!(coord.audit_consistency().unwrap().ok);
}
