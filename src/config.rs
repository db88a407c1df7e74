//! Engine configuration.
//!
//! Every behavior toggle the index consults lives here; there are no ambient
//! singletons. The tree and each worker hold an `Arc<Config>`.

/// Isolation level requested per transaction.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub enum IsolationLevel {
    /// Snapshot Isolation: readers see the commit-mark vector captured at
    /// `begin`, writers first-committer-win on the tuple head.
    #[default]
    SnapshotIsolation,
    /// Serializable on top of SI, via read-timestamp checks or the 2PL
    /// read-lock bitmap depending on [`Config::use_2pl`].
    Serializable,
}

/// Static configuration for a [`VersionedTree`](crate::VersionedTree) and the
/// workers operating on it.
#[derive(Clone, Debug)]
pub struct Config {
    /// Keep version chains at all. When off, updates happen in place and the
    /// WAL record alone supports rollback.
    pub enable_mvcc: bool,
    /// Serializable transactions take 2PL read locks (bitmap bits) instead of
    /// bumping the read-timestamp watermark.
    pub use_2pl: bool,
    /// Allow converting hot chains into fat tuples.
    pub fat_tuple: bool,
    /// log2 of the inverse conversion probability: a chain converts with
    /// probability `2^-threshold` per update. Zero converts on every update.
    pub fat_tuple_threshold: u32,
    /// Force in-place updates even with MVCC enabled (no secondary created).
    pub update_in_place: bool,
    /// Remove drops the slot physically instead of writing a tombstone.
    pub physical_remove: bool,
    /// Stage a deferred GC item for every chain-extending update.
    pub stage_update_todos: bool,
    /// Stage a deferred GC item for every tombstone remove.
    pub stage_remove_todos: bool,
    /// Let GC try the stamped dangling-pointer fast path before re-descending
    /// by key.
    pub dangling_pointer: bool,
    /// Reconstruction walking more versions than this is a fatal invariant
    /// violation (GC too slow, or a cycle).
    pub max_chain_length: usize,
    /// Soft byte budget per leaf; splits keep leaves under it.
    pub leaf_capacity: usize,
    /// Fraction of `leaf_capacity` (in percent) of garbage bytes above which
    /// the space-utilization check runs a page-wise GC pass.
    pub gc_trigger_pct: usize,
    /// Byte budget of the per-worker WAL ring.
    pub wal_ring_capacity: usize,
    /// Fat tuples prune their delta list when it reaches this length.
    pub fat_tuple_max_deltas: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enable_mvcc: true,
            use_2pl: false,
            fat_tuple: true,
            fat_tuple_threshold: 6,
            update_in_place: false,
            physical_remove: false,
            stage_update_todos: true,
            stage_remove_todos: true,
            dangling_pointer: true,
            max_chain_length: 128,
            leaf_capacity: 8192,
            gc_trigger_pct: 25,
            wal_ring_capacity: 1 << 20,
            fat_tuple_max_deltas: 16,
        }
    }
}
