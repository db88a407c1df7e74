//! Snapshot visibility end-to-end.
//!
//! Committed writes become visible to later snapshots; uncommitted and
//! later-committed writes stay hidden behind the version chain, which
//! readers walk to materialize their snapshot's value.

#![allow(missing_docs)]

use std::sync::Arc;

use cadena::{
    CadenaError, Config, IsolationLevel, TxRegistry, UpdateDescriptor, VersionedTree, Worker,
};

fn setup() -> (Arc<TxRegistry>, Arc<Config>, VersionedTree) {
    let config = Arc::new(Config::default());
    let registry = Arc::new(TxRegistry::new());
    let tree = VersionedTree::new(Arc::clone(&config));
    (registry, config, tree)
}

fn worker(registry: &Arc<TxRegistry>, config: &Arc<Config>) -> Worker {
    Worker::new(Arc::clone(registry), Arc::clone(config)).expect("worker slot available")
}

fn set_byte(tree: &VersionedTree, w: &mut Worker, key: &[u8], byte: u8) -> cadena::Result<()> {
    tree.update(w, key, |payload| payload[0] = byte, &UpdateDescriptor::whole(1))
}

/// Scenario 1: W1 inserts and commits; W2 reads the committed value.
#[test]
fn committed_insert_is_visible_to_later_snapshot() -> cadena::Result<()> {
    let (registry, config, tree) = setup();
    let mut w1 = worker(&registry, &config);
    let mut w2 = worker(&registry, &config);

    tree.insert(&mut w1, b"apple", &[0x01])?;
    assert_eq!(tree.lookup(&mut w2, b"apple")?, Some(vec![0x01]));
    Ok(())
}

/// Scenario 2: W1 updates without committing; a snapshot predating the
/// update reads the old value by walking one secondary.
#[test]
fn uncommitted_update_stays_behind_the_chain() -> cadena::Result<()> {
    let (registry, config, tree) = setup();
    let mut w1 = worker(&registry, &config);
    let mut w2 = worker(&registry, &config);

    tree.insert(&mut w1, b"apple", &[0x01])?;

    w1.begin(IsolationLevel::SnapshotIsolation)?;
    set_byte(&tree, &mut w1, b"apple", 0x02)?;
    // The chain now holds head (uncommitted) + one secondary.
    assert_eq!(tree.physical_slot_count(), 2);

    assert_eq!(tree.lookup(&mut w2, b"apple")?, Some(vec![0x01]));

    // W1 itself reads its own write.
    assert_eq!(tree.lookup(&mut w1, b"apple")?, Some(vec![0x02]));

    w1.commit(&tree)?;
    // Scenario 3 (read half): a snapshot begun after the commit sees it.
    assert_eq!(tree.lookup(&mut w2, b"apple")?, Some(vec![0x02]));
    Ok(())
}

/// A reader whose snapshot spans a concurrent commit keeps its view for the
/// whole transaction (repeatable reads).
#[test]
fn snapshot_is_stable_across_concurrent_commit() -> cadena::Result<()> {
    let (registry, config, tree) = setup();
    let mut w1 = worker(&registry, &config);
    let mut w2 = worker(&registry, &config);

    tree.insert(&mut w1, b"k", &[0x01])?;

    w2.begin(IsolationLevel::SnapshotIsolation)?;
    assert_eq!(tree.lookup(&mut w2, b"k")?, Some(vec![0x01]));

    set_byte(&tree, &mut w1, b"k", 0x02)?;

    assert_eq!(
        tree.lookup(&mut w2, b"k")?,
        Some(vec![0x01]),
        "snapshot must not move mid-transaction"
    );
    w2.commit(&tree)?;

    assert_eq!(tree.lookup(&mut w2, b"k")?, Some(vec![0x02]));
    Ok(())
}

/// insert k v; remove k; lookup k -> NOT_FOUND, while an older snapshot
/// still reads the pre-remove value through the image secondary.
#[test]
fn remove_tombstones_for_new_snapshots_only() -> cadena::Result<()> {
    let (registry, config, tree) = setup();
    let mut w1 = worker(&registry, &config);
    let mut w2 = worker(&registry, &config);

    tree.insert(&mut w1, b"k", &[0x07])?;

    w2.begin(IsolationLevel::SnapshotIsolation)?;
    assert_eq!(tree.lookup(&mut w2, b"k")?, Some(vec![0x07]));

    tree.remove(&mut w1, b"k")?;

    // The old snapshot reads through the full-image secondary.
    assert_eq!(tree.lookup(&mut w2, b"k")?, Some(vec![0x07]));
    w2.commit(&tree)?;

    assert_eq!(tree.lookup(&mut w1, b"k")?, None);
    Ok(())
}

#[test]
fn lookup_of_absent_key_is_not_found() -> cadena::Result<()> {
    let (registry, config, tree) = setup();
    let mut w1 = worker(&registry, &config);
    assert_eq!(tree.lookup(&mut w1, b"missing")?, None);
    Ok(())
}

#[test]
fn duplicate_insert_is_rejected() -> cadena::Result<()> {
    let (registry, config, tree) = setup();
    let mut w1 = worker(&registry, &config);
    tree.insert(&mut w1, b"k", &[1])?;
    assert!(matches!(
        tree.insert(&mut w1, b"k", &[2]),
        Err(CadenaError::Duplicate)
    ));
    Ok(())
}

/// Reusing a key whose tombstone has not been collected yet is flagged, not
/// guessed at.
#[test]
fn insert_over_uncollected_tombstone_is_unsupported() -> cadena::Result<()> {
    let (registry, config, tree) = setup();
    let mut w1 = worker(&registry, &config);
    let mut w2 = worker(&registry, &config);

    tree.insert(&mut w1, b"k", &[1])?;
    // Pin the tombstone with an old snapshot so GC cannot collect it.
    w2.begin(IsolationLevel::SnapshotIsolation)?;
    tree.remove(&mut w1, b"k")?;
    assert!(matches!(
        tree.insert(&mut w1, b"k", &[2]),
        Err(CadenaError::Unsupported(_))
    ));
    w2.commit(&tree)?;
    Ok(())
}

#[test]
fn updating_or_removing_absent_key_is_not_found() -> cadena::Result<()> {
    let (registry, config, tree) = setup();
    let mut w1 = worker(&registry, &config);
    assert!(matches!(
        set_byte(&tree, &mut w1, b"missing", 1),
        Err(CadenaError::NotFound)
    ));
    assert!(matches!(
        tree.remove(&mut w1, b"missing"),
        Err(CadenaError::NotFound)
    ));
    Ok(())
}

/// An update conflicting with an uncommitted writer aborts instead of
/// blocking or overwriting.
#[test]
fn concurrent_uncommitted_writer_forces_abort() -> cadena::Result<()> {
    let (registry, config, tree) = setup();
    let mut w1 = worker(&registry, &config);
    let mut w2 = worker(&registry, &config);

    tree.insert(&mut w1, b"k", &[1])?;

    w1.begin(IsolationLevel::SnapshotIsolation)?;
    set_byte(&tree, &mut w1, b"k", 2)?;

    assert!(matches!(
        set_byte(&tree, &mut w2, b"k", 3),
        Err(CadenaError::AbortTx)
    ));
    w1.commit(&tree)?;

    set_byte(&tree, &mut w2, b"k", 3)?;
    assert_eq!(tree.lookup(&mut w2, b"k")?, Some(vec![3]));
    Ok(())
}

/// Ascending and descending scans reconstruct each record for the caller's
/// snapshot, skipping tombstoned and invisible records.
#[test]
fn scans_follow_snapshot_visibility() -> cadena::Result<()> {
    let (registry, config, tree) = setup();
    let mut w1 = worker(&registry, &config);
    let mut w2 = worker(&registry, &config);

    for (i, key) in [b"a", b"b", b"c", b"d"].iter().enumerate() {
        tree.insert(&mut w1, *key, &[i as u8])?;
    }
    tree.remove(&mut w1, b"c")?;

    w2.begin(IsolationLevel::SnapshotIsolation)?;
    let mut seen = Vec::new();
    tree.scan_asc(&mut w2, b"a", |key, value| {
        seen.push((key.to_vec(), value.to_vec()));
        true
    })?;
    assert_eq!(
        seen,
        vec![
            (b"a".to_vec(), vec![0]),
            (b"b".to_vec(), vec![1]),
            (b"d".to_vec(), vec![3]),
        ]
    );

    let mut seen_desc = Vec::new();
    tree.scan_desc(&mut w2, b"d", |key, _value| {
        seen_desc.push(key.to_vec());
        true
    })?;
    assert_eq!(seen_desc, vec![b"d".to_vec(), b"b".to_vec(), b"a".to_vec()]);

    // Early stop.
    let mut first_only = Vec::new();
    tree.scan_asc(&mut w2, b"a", |key, _| {
        first_only.push(key.to_vec());
        false
    })?;
    assert_eq!(first_only, vec![b"a".to_vec()]);
    w2.commit(&tree)?;
    Ok(())
}

/// Values and chains survive leaf splits: many keys with several versions
/// each, spread over multiple leaves.
#[test]
fn visibility_holds_across_leaf_splits() -> cadena::Result<()> {
    let (registry, config, tree) = setup();
    let mut w1 = worker(&registry, &config);
    let mut w2 = worker(&registry, &config);

    for i in 0..200u8 {
        tree.insert(&mut w1, &[b'k', i], &[i, 0, 0, 0])?;
    }
    w2.begin(IsolationLevel::SnapshotIsolation)?;
    for i in 0..200u8 {
        tree.update(
            &mut w1,
            &[b'k', i],
            |payload| payload[1] = 0xEE,
            &UpdateDescriptor::slice(1, 1),
        )?;
    }
    assert!(tree.leaf_count() > 1, "workload should split leaves");
    for i in 0..200u8 {
        assert_eq!(
            tree.lookup(&mut w2, &[b'k', i])?,
            Some(vec![i, 0, 0, 0]),
            "old snapshot must reconstruct the pre-update value"
        );
    }
    w2.commit(&tree)?;
    for i in 0..200u8 {
        assert_eq!(tree.lookup(&mut w1, &[b'k', i])?, Some(vec![i, 0xEE, 0, 0]));
    }
    Ok(())
}
