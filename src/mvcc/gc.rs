//! Version-chain garbage collection.
//!
//! Three cooperating mechanisms. Staged TODOs retire the specific secondary
//! a write created, preferring a stamped dangling-pointer capability over a
//! re-descent by key. Page-wise precise GC sweeps a whole leaf, dropping
//! every slot dominated by the low-water mark and recomputing the page's
//! garbage accounting. The space-utilization entry point is what the host
//! buffer manager calls when it considers a leaf for space recovery.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, trace};

use crate::btree::{leaf::LeafPage, ChainIterator, ExclusiveIterator, LeafRef};
use crate::primitives::latch::HybridLatch;
use crate::txn::Worker;
use crate::types::{ChainSn, Tts, WorkerId};

use super::tuple::{self, TupleFormat};
use super::VersionedTree;

/// Stamped capability referring to the two slots a write touched: valid only
/// while the leaf's latch generation is exactly what the write left behind.
/// Never a raw reference; every use revalidates.
#[derive(Clone, Debug)]
pub struct DanglingPointer {
    pub(crate) leaf: Weak<HybridLatch<LeafPage>>,
    pub(crate) latch_version_should_be: u64,
    pub(crate) head_slot: usize,
    pub(crate) secondary_slot: usize,
    pub(crate) remove_operation: bool,
    pub(crate) valid: bool,
}

impl DanglingPointer {
    /// Captures the capability while the leaf is held exclusively; the
    /// stamped generation is the one the leaf will carry after release.
    pub(crate) fn stamped(
        leaf: &LeafRef,
        latch_version_should_be: u64,
        head_slot: usize,
        remove_operation: bool,
    ) -> Self {
        Self {
            leaf: Arc::downgrade(leaf),
            latch_version_should_be,
            head_slot,
            secondary_slot: 0,
            remove_operation,
            valid: false,
        }
    }

    /// Re-checks the capability against the iterator's current position
    /// after the secondary insert: same leaf, same pending generation, and
    /// the head key still in its slot.
    pub(crate) fn revalidate(&self, iter: &ExclusiveIterator<'_>, head_key: &[u8]) -> bool {
        let Some(leaf) = self.leaf.upgrade() else {
            return false;
        };
        if !Arc::ptr_eq(&leaf, iter.leaf_handle()) {
            return false;
        }
        if iter.latch_version_after_release() != self.latch_version_should_be {
            return false;
        }
        let page = iter.leaf();
        self.head_slot < page.slot_count() && page.key(self.head_slot) == head_key
    }
}

/// Deferred GC work item staged by a chain-extending write and dispatched
/// once its commit mark drops to or below the global low-water mark.
#[derive(Clone, Debug)]
pub struct GcTodo {
    pub worker_id: WorkerId,
    pub tts: Tts,
    pub user_key: Vec<u8>,
    pub sn: ChainSn,
    pub dangling: DanglingPointer,
}

/// Reply of the space-utilization entry point.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SpaceCheckResult {
    /// Nothing reclaimed.
    Nothing,
    /// Space was reclaimed; the caller should re-evaluate the same frame.
    RetrySameBf,
}

/// Snapshot of TODO-execution counters, for observability and tests.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct GcStats {
    /// Staged TODOs retired through a still-valid dangling pointer, without
    /// a descent.
    pub todo_fast_hits: u64,
    /// Staged TODOs that re-descended by key.
    pub todo_descents: u64,
}

#[derive(Debug, Default)]
pub(crate) struct GcCounters {
    fast_hits: AtomicU64,
    descents: AtomicU64,
}

impl VersionedTree {
    /// Executes one staged TODO.
    pub(crate) fn execute_todo(&self, worker: &Worker, todo: &GcTodo) {
        if self.config().dangling_pointer && todo.dangling.valid {
            if let Some(leaf_ref) = todo.dangling.leaf.upgrade() {
                if let Some(guard) =
                    leaf_ref.try_write_if_version(todo.dangling.latch_version_should_be)
                {
                    let iter = ExclusiveIterator::from_capability(
                        self.btree(),
                        Arc::clone(&leaf_ref),
                        guard,
                        todo.dangling.head_slot,
                    );
                    if self.execute_todo_fast(todo, iter) {
                        self.gc_counters.fast_hits.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                }
            }
        }
        self.execute_todo_slow(worker, todo);
    }

    /// Fast path: the latch generation matched, so the leaf should be as the
    /// staging write left it. Validates the recorded slots anyway (a
    /// contention split retains the generation but moves slots) and reports
    /// `false` so the caller re-descends when anything is off.
    fn execute_todo_fast(&self, todo: &GcTodo, mut iter: ExclusiveIterator<'_>) -> bool {
        let head_slot = todo.dangling.head_slot;
        let secondary_slot = todo.dangling.secondary_slot;
        if secondary_slot >= iter.leaf().slot_count() || head_slot >= secondary_slot {
            return false;
        }
        let head = iter.leaf().value(head_slot);
        if !matches!(tuple::format(head), Ok(TupleFormat::Chained)) {
            return false;
        }
        if tuple::is_write_locked(head) {
            return false;
        }
        if tuple::stamp(head) != (todo.worker_id, todo.tts) {
            return false;
        }
        let secondary_key = tuple::compose_key(&todo.user_key, todo.sn);
        if iter.leaf().key(secondary_slot) != secondary_key.as_slice() {
            return false;
        }
        if tuple::is_removed(head) {
            let freed = iter.leaf().kv_consumed_space(secondary_slot)
                + iter.leaf().kv_consumed_space(head_slot);
            let leaf = iter.leaf_mut();
            leaf.gc_space_used = leaf.gc_space_used.saturating_sub(freed);
            // Higher slot first so the head index stays valid.
            leaf.remove_slot(secondary_slot);
            leaf.remove_slot(head_slot);
            trace!(key = ?todo.user_key, "todo fast path collected tombstone");
        } else {
            let next = tuple::next_sn(iter.leaf().value(secondary_slot));
            let freed = iter.leaf().kv_consumed_space(secondary_slot);
            let leaf = iter.leaf_mut();
            let head_mut = leaf.value_mut(head_slot);
            tuple::primary_reset(head_mut);
            tuple::set_next_sn(head_mut, next);
            leaf.gc_space_used = leaf.gc_space_used.saturating_sub(freed);
            leaf.remove_slot(secondary_slot);
            trace!(key = ?todo.user_key, "todo fast path retired secondary");
        }
        iter.cur = 0;
        iter.merge_if_needed();
        true
    }

    /// Slow path: re-descend by key and prune whatever part of the chain the
    /// low-water mark dominates.
    fn execute_todo_slow(&self, worker: &Worker, todo: &GcTodo) {
        self.gc_counters.descents.fetch_add(1, Ordering::Relaxed);
        let mut key = tuple::compose_key(&todo.user_key, 0);
        let mut iter = ExclusiveIterator::new(self.btree());
        if !iter.seek_exact(&key) {
            // Already collected; a legitimate outcome.
            return;
        }
        if !matches!(tuple::format(iter.value()), Ok(TupleFormat::Chained)) {
            // Converted to a fat tuple since staging; its deltas prune
            // themselves.
            return;
        }
        if tuple::is_write_locked(iter.value()) {
            return;
        }

        let mut remove_next_sn: ChainSn = 0;
        let (head_worker, head_mark) = tuple::stamp(iter.value());
        if head_worker == todo.worker_id && head_mark == todo.tts {
            // The head itself is the version being retired.
            remove_next_sn = tuple::next_sn(iter.value());
            if tuple::is_removed(iter.value()) {
                let freed = iter.leaf().kv_consumed_space(iter.cur);
                let leaf = iter.leaf_mut();
                leaf.gc_space_used = leaf.gc_space_used.saturating_sub(freed);
                iter.remove_current();
                iter.merge_if_needed();
                trace!(key = ?todo.user_key, "todo collected tombstone");
            } else {
                let head_mut = iter.mutable_value();
                tuple::primary_reset(head_mut);
                tuple::set_next_sn(head_mut, 0);
                trace!(key = ?todo.user_key, "todo reset head");
            }
        } else {
            // Keep the first version every snapshot can already see (or the
            // one the TODO was staged for) and cut the chain behind it.
            let mut search_sn = tuple::next_sn(iter.value());
            while search_sn != 0 {
                let higher = search_sn >= tuple::key_sn(&key);
                tuple::set_key_sn(&mut key, search_sn);
                if !iter.seek_exact_with_hint(&key, higher) {
                    break;
                }
                let version = iter.value();
                let (version_worker, version_mark) = tuple::stamp(version);
                let dominated = worker.is_visible_for_all(tuple::committed_before_sat(version));
                if dominated || (version_worker == todo.worker_id && version_mark == todo.tts) {
                    remove_next_sn = tuple::next_sn(version);
                    tuple::set_next_sn(iter.mutable_value(), 0);
                    break;
                }
                search_sn = tuple::next_sn(version);
            }
        }

        while remove_next_sn != 0 {
            let higher = remove_next_sn >= tuple::key_sn(&key);
            tuple::set_key_sn(&mut key, remove_next_sn);
            if !iter.seek_exact_with_hint(&key, higher) {
                break;
            }
            remove_next_sn = tuple::next_sn(iter.value());
            let freed = iter.leaf().kv_consumed_space(iter.cur);
            let leaf = iter.leaf_mut();
            leaf.gc_space_used = leaf.gc_space_used.saturating_sub(freed);
            iter.remove_current();
            iter.merge_if_needed();
            iter.mark_as_dirty();
        }
    }

    /// Page-wise precise GC: drops every slot dominated by the low-water
    /// mark, recomputes the page's garbage accounting, and records the
    /// page-skip hint when every head is invisible to the scanner.
    pub(crate) fn precise_page_wise_gc(&self, worker: &Worker, leaf: &mut LeafPage) {
        let lwm = worker.registry().low_water_mark();
        let can_check_visibility = worker.in_transaction();
        let mut all_heads_invisible = can_check_visibility;
        let mut garbage_seen = 0usize;
        let mut freed = 0usize;
        let mut slot = 0usize;
        while slot < leaf.slot_count() {
            let sn = tuple::key_sn(leaf.key(slot));
            let buf = leaf.value(slot);
            let Ok(format) = tuple::format(buf) else {
                slot += 1;
                continue;
            };
            if sn == 0 {
                let (head_worker, head_mark) = tuple::stamp(buf);
                let visible = can_check_visibility
                    && worker.is_visible_for_me(head_worker, head_mark);
                match format {
                    TupleFormat::Chained if tuple::is_removed(buf) => {
                        // A visible tombstone reads as "record absent".
                        all_heads_invisible &= visible;
                        let size = leaf.kv_consumed_space(slot);
                        if head_mark <= lwm {
                            leaf.remove_slot(slot);
                            freed += size;
                        } else {
                            garbage_seen += size;
                            slot += 1;
                        }
                    }
                    TupleFormat::Chained | TupleFormat::Fat => {
                        all_heads_invisible &= !visible;
                        slot += 1;
                    }
                }
            } else {
                let size = leaf.kv_consumed_space(slot);
                if tuple::gc_trigger(buf) <= lwm {
                    leaf.remove_slot(slot);
                    freed += size;
                } else {
                    garbage_seen += size;
                    slot += 1;
                }
            }
        }
        leaf.gc_space_used = garbage_seen;
        if freed > 0 || all_heads_invisible {
            leaf.bump_gsn();
        }
        if all_heads_invisible {
            leaf.set_skip_hint(worker.sat());
        }
        debug!(freed, garbage_seen, "page-wise gc pass");
    }

    /// Space-utilization entry point: decides under an optimistic guard
    /// whether a pass is warranted, then runs it exclusively.
    pub fn check_space_utilization(&self, worker: &Worker, leaf_ref: &LeafRef) -> SpaceCheckResult {
        {
            let Some(guard) = leaf_ref.try_read() else {
                return SpaceCheckResult::Nothing;
            };
            if guard.is_dead() || !self.trigger_page_wise_gc(&guard) {
                return SpaceCheckResult::Nothing;
            }
        }
        let mut guard = leaf_ref.write();
        if guard.is_dead() {
            return SpaceCheckResult::Nothing;
        }
        let before = guard.slot_count();
        self.precise_page_wise_gc(worker, &mut guard);
        if guard.slot_count() < before {
            SpaceCheckResult::RetrySameBf
        } else {
            SpaceCheckResult::Nothing
        }
    }

    fn trigger_page_wise_gc(&self, leaf: &LeafPage) -> bool {
        leaf.gc_space_used > 0
            && leaf.gc_space_used * 100 >= leaf.capacity() * self.config().gc_trigger_pct
    }

    /// Snapshot of the TODO-execution counters.
    pub fn gc_stats(&self) -> GcStats {
        GcStats {
            todo_fast_hits: self.gc_counters.fast_hits.load(Ordering::Relaxed),
            todo_descents: self.gc_counters.descents.load(Ordering::Relaxed),
        }
    }

    /// Sweeps every leaf through the space-utilization check. A convenience
    /// driver standing in for the host buffer manager's space recovery.
    pub fn sweep(&self, worker: &Worker) -> usize {
        let mut reclaimed = 0;
        let mut cursor = self.btree().leaf_at_or_after(&[]);
        while let Some((fence, leaf_ref)) = cursor {
            if self.check_space_utilization(worker, &leaf_ref) == SpaceCheckResult::RetrySameBf {
                reclaimed += 1;
            }
            cursor = self.btree().leaf_after(&fence);
        }
        reclaimed
    }
}
