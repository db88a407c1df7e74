//! Workers and the transaction registry.
//!
//! Every thread operating on the index owns a [`Worker`] pinned to an id in
//! `0..64`. The shared [`TxRegistry`] holds the global clock, each worker's
//! latest commit mark, and each worker's active-snapshot floor, from which
//! the global low-water mark is derived. Visibility is a pure function of
//! the observer's captured commit-mark vector; commit marks equal the
//! writing transaction's timestamp and are monotone per worker because a
//! worker runs one transaction at a time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashSet;
use tracing::{debug, trace};

use crate::config::{Config, IsolationLevel};
use crate::mvcc::gc::GcTodo;
use crate::mvcc::VersionedTree;
use crate::primitives::wal::{WalRecord, WalRing};
use crate::types::{CadenaError, ChainSn, CommitMark, Result, Sat, Tts, WorkerId, MAX_WORKERS};

/// Snapshot floor published while a worker has no active transaction.
const IDLE_FLOOR: u64 = u64::MAX;

/// Shared transaction bookkeeping for a set of workers.
pub struct TxRegistry {
    clock: AtomicU64,
    commit_marks: Vec<AtomicU64>,
    snapshot_floors: Vec<AtomicU64>,
    next_worker: AtomicUsize,
}

impl TxRegistry {
    pub fn new() -> Self {
        Self {
            clock: AtomicU64::new(1),
            commit_marks: (0..MAX_WORKERS).map(|_| AtomicU64::new(0)).collect(),
            snapshot_floors: (0..MAX_WORKERS).map(|_| AtomicU64::new(IDLE_FLOOR)).collect(),
            next_worker: AtomicUsize::new(0),
        }
    }

    fn allocate_worker(&self) -> Result<WorkerId> {
        let id = self.next_worker.fetch_add(1, Ordering::SeqCst);
        if id >= MAX_WORKERS {
            return Err(CadenaError::Invalid("worker limit reached"));
        }
        Ok(WorkerId(id as u8))
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst)
    }

    /// The oldest timestamp any active snapshot could still observe. With no
    /// snapshot active this is the current clock, which exceeds every
    /// committed mark. Conservative: an active snapshot pins the minimum of
    /// its captured commit-mark vector.
    pub fn low_water_mark(&self) -> u64 {
        let mut lwm = self.clock.load(Ordering::SeqCst);
        for floor in &self.snapshot_floors {
            lwm = lwm.min(floor.load(Ordering::SeqCst));
        }
        lwm
    }

    fn capture_snapshot(&self) -> Vec<CommitMark> {
        self.commit_marks
            .iter()
            .map(|mark| mark.load(Ordering::SeqCst))
            .collect()
    }

    /// Lower bound of what a snapshot with this commit-mark vector might
    /// still need: the minimum captured mark, over allocated workers only.
    /// A worker registered later has no versions in the tree older than the
    /// capture, so it cannot lower the floor.
    fn snapshot_floor(&self, snapshot: &[CommitMark]) -> CommitMark {
        let allocated = self.next_worker.load(Ordering::SeqCst).min(MAX_WORKERS);
        snapshot[..allocated.max(1)]
            .iter()
            .copied()
            .min()
            .unwrap_or(0)
    }
}

impl Default for TxRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct ActiveTx {
    tts: Tts,
    sat: Sat,
    isolation: IsolationLevel,
    single_statement: bool,
    snapshot: Vec<CommitMark>,
}

/// One worker thread's transaction context.
pub struct Worker {
    id: WorkerId,
    registry: Arc<TxRegistry>,
    config: Arc<Config>,
    wal: WalRing,
    todos: VecDeque<GcTodo>,
    read_locked: FxHashSet<Vec<u8>>,
    active: Option<ActiveTx>,
    rng: StdRng,
}

impl Worker {
    /// Registers a new worker. Fails once the 64-worker limit is reached.
    pub fn new(registry: Arc<TxRegistry>, config: Arc<Config>) -> Result<Self> {
        let id = registry.allocate_worker()?;
        let wal = WalRing::new(config.wal_ring_capacity);
        Ok(Self {
            id,
            registry,
            config,
            wal,
            todos: VecDeque::new(),
            read_locked: FxHashSet::default(),
            active: None,
            rng: StdRng::from_entropy(),
        })
    }

    pub fn worker_id(&self) -> WorkerId {
        self.id
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TxRegistry> {
        &self.registry
    }

    /// Begins an explicit transaction.
    pub fn begin(&mut self, isolation: IsolationLevel) -> Result<()> {
        if self.active.is_some() {
            return Err(CadenaError::Invalid("transaction already active"));
        }
        self.start_tx(isolation, false);
        Ok(())
    }

    fn start_tx(&mut self, isolation: IsolationLevel, single_statement: bool) {
        let tts = self.registry.tick();
        let snapshot = self.registry.capture_snapshot();
        let floor = self.registry.snapshot_floor(&snapshot);
        self.registry.snapshot_floors[self.id.index()].store(floor, Ordering::SeqCst);
        trace!(worker = %self.id, tts, floor, "begin tx");
        self.active = Some(ActiveTx {
            tts,
            sat: tts,
            isolation,
            single_statement,
            snapshot,
        });
    }

    /// Starts an implicit single-statement transaction if none is active.
    pub(crate) fn ensure_tx(&mut self) {
        if self.active.is_none() {
            self.start_tx(IsolationLevel::SnapshotIsolation, true);
        }
    }

    /// Commits the active transaction: publishes the commit mark, releases
    /// read locks, and discards the rollback log.
    pub fn commit(&mut self, tree: &VersionedTree) -> Result<()> {
        let tx = self
            .active
            .take()
            .ok_or(CadenaError::Invalid("no active transaction"))?;
        self.release_read_locks(tree);
        self.registry.commit_marks[self.id.index()].store(tx.tts, Ordering::SeqCst);
        self.registry.snapshot_floors[self.id.index()].store(IDLE_FLOOR, Ordering::SeqCst);
        self.wal.discard();
        debug!(worker = %self.id, tts = tx.tts, "commit");
        Ok(())
    }

    /// Aborts the active transaction, replaying its WAL records newest-first
    /// through the index undo machinery. No writes persist.
    pub fn abort(&mut self, tree: &VersionedTree) -> Result<()> {
        if self.active.is_none() {
            return Err(CadenaError::Invalid("no active transaction"));
        }
        let records = self.wal.drain_for_undo();
        debug!(worker = %self.id, records = records.len(), "abort");
        for record in records.iter().rev() {
            tree.undo_record(self, record);
        }
        self.release_read_locks(tree);
        let _ = self.active.take();
        self.registry.snapshot_floors[self.id.index()].store(IDLE_FLOOR, Ordering::SeqCst);
        Ok(())
    }

    fn release_read_locks(&mut self, tree: &VersionedTree) {
        if self.read_locked.is_empty() {
            return;
        }
        let keys: Vec<Vec<u8>> = self.read_locked.drain().collect();
        for key in keys {
            tree.release_read_lock(self.id, &key);
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.active.is_some()
    }

    fn tx(&self) -> &ActiveTx {
        self.active.as_ref().expect("active transaction")
    }

    /// Timestamp of the running transaction.
    pub fn tts(&self) -> Tts {
        self.tx().tts
    }

    /// Snapshot acquisition time of the running transaction.
    pub fn sat(&self) -> Sat {
        self.tx().sat
    }

    pub fn is_serializable(&self) -> bool {
        self.tx().isolation == IsolationLevel::Serializable
    }

    pub fn is_single_statement(&self) -> bool {
        self.active.as_ref().map_or(false, |tx| tx.single_statement)
    }

    /// Whether the running transaction is at least snapshot-isolated. Every
    /// supported level is.
    pub fn at_least_si(&self) -> bool {
        matches!(
            self.tx().isolation,
            IsolationLevel::SnapshotIsolation | IsolationLevel::Serializable
        )
    }

    /// Whether a version stamped `(worker_id, commit_mark)` is visible to the
    /// running transaction's snapshot. A worker's own versions are visible
    /// through its current timestamp (read-your-writes).
    pub fn is_visible_for_me(&self, worker_id: WorkerId, commit_mark: CommitMark) -> bool {
        let tx = self.tx();
        if worker_id == self.id {
            commit_mark <= tx.tts
        } else {
            commit_mark <= tx.snapshot[worker_id.index()]
        }
    }

    /// Whether a version superseded under SAT watermark `sat` is visible to
    /// every possible snapshot, current and future.
    pub fn is_visible_for_all(&self, sat: Sat) -> bool {
        sat <= self.registry.low_water_mark()
    }

    /// Fails early when the rollback log cannot take `bytes` more.
    pub(crate) fn wal_ensure_enough_space(&self, bytes: usize) -> Result<()> {
        self.wal.ensure_enough_space(bytes)
    }

    pub(crate) fn wal_append(&mut self, record: WalRecord) -> Result<()> {
        self.wal.append(record)
    }

    /// Records a 2PL read lock taken on `user_key` for release at tx end.
    pub(crate) fn note_read_lock(&mut self, user_key: &[u8]) {
        self.read_locked.insert(user_key.to_vec());
    }

    /// Stages a deferred GC item; it dispatches once its commit mark drops
    /// to or below the global low-water mark.
    pub(crate) fn stage_todo(&mut self, todo: GcTodo) {
        self.todos.push_back(todo);
    }

    /// Number of staged, not yet dispatched GC items.
    pub fn staged_todo_count(&self) -> usize {
        self.todos.len()
    }

    /// Dispatches every staged GC item whose commit mark the low-water mark
    /// has passed. Staged marks are monotone per worker, so dispatch stops at
    /// the first ineligible entry.
    pub fn collect_garbage(&mut self, tree: &VersionedTree) {
        let lwm = self.registry.low_water_mark();
        let mut due = Vec::new();
        while let Some(front) = self.todos.front() {
            if front.tts > lwm {
                break;
            }
            due.push(self.todos.pop_front().expect("front exists"));
        }
        for todo in due {
            tree.execute_todo(self, &todo);
        }
    }

    /// Fresh random secondary SN in `[1, upper]`.
    pub(crate) fn random_sn(&mut self, upper: ChainSn) -> ChainSn {
        let upper = upper.max(1);
        self.rng.gen_range(1..=upper)
    }

    /// Conversion coin: true with probability `2^-threshold`.
    pub(crate) fn fat_coin(&mut self, threshold: u32) -> bool {
        if threshold == 0 {
            return true;
        }
        if threshold >= 64 {
            return false;
        }
        self.rng.gen::<u64>() & ((1u64 << threshold) - 1) == 0
    }
}
