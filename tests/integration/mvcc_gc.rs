//! Garbage collection end-to-end: staged TODOs (fast path and keyed
//! re-descent), the low-water-mark safety gate, and page-wise compaction.

#![allow(missing_docs)]

use std::sync::Arc;

use cadena::{Config, IsolationLevel, TxRegistry, UpdateDescriptor, VersionedTree, Worker};

fn setup_with(config: Config) -> (Arc<TxRegistry>, Arc<Config>, VersionedTree) {
    let config = Arc::new(config);
    let registry = Arc::new(TxRegistry::new());
    let tree = VersionedTree::new(Arc::clone(&config));
    (registry, config, tree)
}

fn setup() -> (Arc<TxRegistry>, Arc<Config>, VersionedTree) {
    setup_with(Config::default())
}

fn worker(registry: &Arc<TxRegistry>, config: &Arc<Config>) -> Worker {
    Worker::new(Arc::clone(registry), Arc::clone(config)).expect("worker slot available")
}

fn set_byte(tree: &VersionedTree, w: &mut Worker, key: &[u8], byte: u8) -> cadena::Result<()> {
    tree.update(w, key, |payload| payload[0] = byte, &UpdateDescriptor::whole(1))
}

/// Scenario 3: once the low-water mark passes the update's commit, the
/// staged TODO collapses the chain back to a single primary — and, with the
/// leaf untouched since the update, through the dangling-pointer fast path,
/// never a descent.
#[test]
fn todo_fast_path_collapses_chain_after_lwm_advance() -> cadena::Result<()> {
    let (registry, config, tree) = setup();
    let mut w1 = worker(&registry, &config);

    tree.insert(&mut w1, b"apple", &[0x01])?;
    set_byte(&tree, &mut w1, b"apple", 0x02)?;
    assert_eq!(tree.physical_slot_count(), 2);
    assert_eq!(w1.staged_todo_count(), 1);

    w1.collect_garbage(&tree);
    assert_eq!(w1.staged_todo_count(), 0);
    assert_eq!(tree.physical_slot_count(), 1, "chain should collapse");
    let stats = tree.gc_stats();
    assert_eq!(stats.todo_fast_hits, 1, "latch generation was unchanged");
    assert_eq!(stats.todo_descents, 0, "fast path must not re-descend");
    assert_eq!(tree.lookup(&mut w1, b"apple")?, Some(vec![0x02]));
    Ok(())
}

/// The same collapse through the keyed re-descent when the dangling-pointer
/// fast path is disabled.
#[test]
fn todo_slow_path_collapses_chain_too() -> cadena::Result<()> {
    let (registry, config, tree) = setup_with(Config {
        dangling_pointer: false,
        ..Config::default()
    });
    let mut w1 = worker(&registry, &config);

    tree.insert(&mut w1, b"apple", &[0x01])?;
    set_byte(&tree, &mut w1, b"apple", 0x02)?;
    w1.collect_garbage(&tree);
    assert_eq!(tree.physical_slot_count(), 1);
    let stats = tree.gc_stats();
    assert_eq!(stats.todo_fast_hits, 0);
    assert_eq!(stats.todo_descents, 1);
    assert_eq!(tree.lookup(&mut w1, b"apple")?, Some(vec![0x02]));
    Ok(())
}

/// GC safety: while an older snapshot is active the TODO stays staged and
/// the secondary survives, keeping reconstruction deterministic.
#[test]
fn active_snapshot_blocks_collection() -> cadena::Result<()> {
    let (registry, config, tree) = setup();
    let mut w1 = worker(&registry, &config);
    let mut w2 = worker(&registry, &config);

    tree.insert(&mut w1, b"k", &[0x01])?;
    w2.begin(IsolationLevel::SnapshotIsolation)?;
    set_byte(&tree, &mut w1, b"k", 0x02)?;

    w1.collect_garbage(&tree);
    assert_eq!(
        w1.staged_todo_count(),
        1,
        "todo must stay staged while the snapshot is active"
    );
    assert_eq!(tree.physical_slot_count(), 2);
    assert_eq!(tree.lookup(&mut w2, b"k")?, Some(vec![0x01]));
    w2.commit(&tree)?;

    w1.collect_garbage(&tree);
    assert_eq!(tree.physical_slot_count(), 1);
    Ok(())
}

/// Scenario 5: a collected remove drops the tombstone and its image
/// secondary together.
#[test]
fn todo_collects_tombstone_and_image_together() -> cadena::Result<()> {
    let (registry, config, tree) = setup();
    let mut w1 = worker(&registry, &config);
    let mut w2 = worker(&registry, &config);

    tree.insert(&mut w1, b"k", &[0x09])?;

    w2.begin(IsolationLevel::SnapshotIsolation)?;
    tree.remove(&mut w1, b"k")?;
    assert_eq!(tree.lookup(&mut w2, b"k")?, Some(vec![0x09]));
    w2.commit(&tree)?;

    w1.collect_garbage(&tree);
    assert_eq!(tree.physical_slot_count(), 0, "tombstone and image both go");
    // Concurrent reads latched the leaf in shared mode only, so the
    // capability stayed valid.
    assert_eq!(tree.gc_stats().todo_fast_hits, 1);
    assert_eq!(tree.lookup(&mut w1, b"k")?, None);
    Ok(())
}

/// A long update history collapses to the head; stale TODOs for already
/// pruned versions are harmless.
#[test]
fn repeated_updates_fully_collapse() -> cadena::Result<()> {
    let (registry, config, tree) = setup();
    let mut w1 = worker(&registry, &config);

    tree.insert(&mut w1, b"k", &[0x00])?;
    for i in 1..=5u8 {
        set_byte(&tree, &mut w1, b"k", i)?;
    }
    assert_eq!(tree.physical_slot_count(), 6);
    assert_eq!(w1.staged_todo_count(), 5);

    w1.collect_garbage(&tree);
    assert_eq!(tree.physical_slot_count(), 1);
    assert_eq!(tree.lookup(&mut w1, b"k")?, Some(vec![0x05]));
    Ok(())
}

/// Page-wise compaction prunes dominated secondaries without any TODO.
#[test]
fn page_wise_sweep_prunes_dominated_versions() -> cadena::Result<()> {
    let (registry, config, tree) = setup_with(Config {
        gc_trigger_pct: 0,
        stage_update_todos: false,
        stage_remove_todos: false,
        ..Config::default()
    });
    let mut w1 = worker(&registry, &config);

    tree.insert(&mut w1, b"k", &[0x00])?;
    for i in 1..=4u8 {
        set_byte(&tree, &mut w1, b"k", i)?;
    }
    assert_eq!(tree.physical_slot_count(), 5);
    assert_eq!(w1.staged_todo_count(), 0);

    let reclaimed = tree.sweep(&w1);
    assert!(reclaimed > 0);
    assert_eq!(tree.physical_slot_count(), 1);
    assert_eq!(tree.lookup(&mut w1, b"k")?, Some(vec![0x04]));
    Ok(())
}

/// Tombstones dominated by the low-water mark disappear in the page-wise
/// pass, leaving the page empty.
#[test]
fn page_wise_sweep_collects_tombstones() -> cadena::Result<()> {
    let (registry, config, tree) = setup_with(Config {
        gc_trigger_pct: 0,
        stage_update_todos: false,
        stage_remove_todos: false,
        ..Config::default()
    });
    let mut w1 = worker(&registry, &config);

    for key in [b"k1", b"k2", b"k3", b"k4"] {
        tree.insert(&mut w1, key, &[0x01])?;
    }
    for key in [b"k1", b"k2", b"k3", b"k4"] {
        tree.remove(&mut w1, key)?;
    }
    assert_eq!(tree.physical_slot_count(), 8);

    // Run the sweep inside a transaction begun after all removes: the
    // scanner's own snapshot floor is past every tombstone.
    w1.begin(IsolationLevel::SnapshotIsolation)?;
    let reclaimed = tree.sweep(&w1);
    w1.commit(&tree)?;
    assert!(reclaimed > 0);
    assert_eq!(tree.physical_slot_count(), 0);
    Ok(())
}

/// No version with `gc_trigger` above the low-water mark is ever removed by
/// the page-wise pass.
#[test]
fn page_wise_sweep_respects_the_lwm() -> cadena::Result<()> {
    let (registry, config, tree) = setup_with(Config {
        gc_trigger_pct: 0,
        stage_update_todos: false,
        ..Config::default()
    });
    let mut w1 = worker(&registry, &config);
    let mut w2 = worker(&registry, &config);

    tree.insert(&mut w1, b"k", &[0x01])?;
    w2.begin(IsolationLevel::SnapshotIsolation)?;
    set_byte(&tree, &mut w1, b"k", 0x02)?;

    let reclaimed = tree.sweep(&w1);
    assert_eq!(reclaimed, 0, "secondary pinned by the active snapshot");
    assert_eq!(tree.physical_slot_count(), 2);
    assert_eq!(tree.lookup(&mut w2, b"k")?, Some(vec![0x01]));
    w2.commit(&tree)?;
    Ok(())
}
