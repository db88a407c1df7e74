//! The leaf store: latched slotted leaves behind a fence-keyed directory.
//!
//! Balancing (split/merge) and key search are deliberately plain here; the
//! interesting machinery of this crate sits in the MVCC layer above. The
//! directory maps each leaf's low fence to its latch. Finders clone the leaf
//! handle and release the directory before latching, then re-check fences
//! and the dead flag; a concurrent split or merge simply sends them around
//! the loop again. The only path holding two leaf latches is a merge, which
//! always latches left before right.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::primitives::latch::{ExclusiveGuard, HybridLatch, SharedGuard};

pub mod iter;
pub mod leaf;

pub use iter::{ChainIterator, ExclusiveIterator, InsertOutcome, SeekInsert, SharedIterator};
pub use leaf::LeafPage;

/// Shared handle to a latched leaf. Pointer identity doubles as the
/// buffer-frame identity used by GC dangling pointers.
pub type LeafRef = Arc<HybridLatch<LeafPage>>;

/// An ordered collection of leaf pages.
pub struct BTree {
    leaves: RwLock<BTreeMap<Vec<u8>, LeafRef>>,
    leaf_capacity: usize,
}

impl BTree {
    /// Creates a tree with a single empty leaf spanning the whole key space.
    pub fn new(leaf_capacity: usize) -> Self {
        let first = LeafPage::new(Vec::new(), None, leaf_capacity);
        let mut leaves = BTreeMap::new();
        leaves.insert(Vec::new(), Arc::new(HybridLatch::new(first)));
        Self {
            leaves: RwLock::new(leaves),
            leaf_capacity,
        }
    }

    pub fn leaf_capacity(&self) -> usize {
        self.leaf_capacity
    }

    /// Number of live leaves.
    pub fn leaf_count(&self) -> usize {
        self.leaves.read().len()
    }

    /// Handle of the leaf whose fence range should contain `key`. The handle
    /// may be stale by the time it is latched; callers re-check.
    pub fn find_leaf(&self, key: &[u8]) -> LeafRef {
        let map = self.leaves.read();
        let (_, leaf) = map
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .expect("the leftmost leaf always exists");
        Arc::clone(leaf)
    }

    /// Latches the covering leaf exclusively, retrying across concurrent
    /// splits and merges.
    pub(crate) fn leaf_exclusive(&self, key: &[u8]) -> (LeafRef, ExclusiveGuard<LeafPage>) {
        loop {
            let leaf = self.find_leaf(key);
            let guard = leaf.write();
            if !guard.is_dead() && guard.covers(key) {
                return (leaf, guard);
            }
        }
    }

    /// Latches the covering leaf in shared mode.
    pub(crate) fn leaf_shared(&self, key: &[u8]) -> (LeafRef, SharedGuard<LeafPage>) {
        loop {
            let leaf = self.find_leaf(key);
            let guard = leaf.read();
            if !guard.is_dead() && guard.covers(key) {
                return (leaf, guard);
            }
        }
    }

    /// Optimistic acquisition: a single non-blocking attempt. `None` means a
    /// writer holds the leaf (or the range moved) and the caller should fall
    /// back to the pessimistic path.
    pub(crate) fn try_leaf_shared(&self, key: &[u8]) -> Option<(LeafRef, SharedGuard<LeafPage>)> {
        let leaf = self.find_leaf(key);
        let guard = leaf.try_read()?;
        if guard.is_dead() || !guard.covers(key) {
            return None;
        }
        Some((leaf, guard))
    }

    /// Handle of the first leaf at or after `from` in fence order, for scans.
    pub(crate) fn leaf_at_or_after(&self, from: &[u8]) -> Option<(Vec<u8>, LeafRef)> {
        let map = self.leaves.read();
        // The covering leaf first, then fence order takes over.
        let covering = map
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(from)))
            .next_back()
            .map(|(fence, leaf)| (fence.clone(), Arc::clone(leaf)));
        covering
    }

    /// Handle of the leaf directly after the one fenced at `fence`.
    pub(crate) fn leaf_after(&self, fence: &[u8]) -> Option<(Vec<u8>, LeafRef)> {
        let map = self.leaves.read();
        map.range::<[u8], _>((Bound::Excluded(fence), Bound::Unbounded))
            .next()
            .map(|(f, leaf)| (f.clone(), Arc::clone(leaf)))
    }

    /// Handle of the last leaf in fence order.
    pub(crate) fn last_leaf(&self) -> (Vec<u8>, LeafRef) {
        let map = self.leaves.read();
        let (fence, leaf) = map.iter().next_back().expect("the leftmost leaf always exists");
        (fence.clone(), Arc::clone(leaf))
    }

    /// Handle of the leaf directly before the one fenced at `fence`.
    pub(crate) fn leaf_before(&self, fence: &[u8]) -> Option<(Vec<u8>, LeafRef)> {
        let map = self.leaves.read();
        map.range::<[u8], _>((Bound::Unbounded, Bound::Excluded(fence)))
            .next_back()
            .map(|(f, leaf)| (f.clone(), Arc::clone(leaf)))
    }

    /// Splits the leaf held by `guard` and publishes the new right sibling.
    /// The caller re-seeks afterwards; its guard keeps covering the left
    /// half only.
    pub(crate) fn split_leaf(&self, guard: &mut ExclusiveGuard<LeafPage>) -> LeafRef {
        let (separator, right_page) = guard.split();
        let right = Arc::new(HybridLatch::new(right_page));
        trace!(separator = ?separator, "leaf split");
        self.leaves.write().insert(separator, Arc::clone(&right));
        right
    }

    /// Folds the right neighbor of the leaf held by `guard` into it when the
    /// combined contents fit. Returns whether a merge happened.
    pub(crate) fn try_merge_right(&self, guard: &mut ExclusiveGuard<LeafPage>) -> bool {
        let Some(high_fence) = guard.high_fence().map(<[u8]>::to_vec) else {
            return false;
        };
        let Some((fence, right_ref)) = self.leaf_after(guard.low_fence().to_vec().as_slice()) else {
            return false;
        };
        if fence != high_fence {
            return false;
        }
        let mut right = right_ref.write();
        if right.is_dead() || right.low_fence() != high_fence.as_slice() {
            return false;
        }
        if guard.used_bytes() + right.used_bytes() > guard.capacity() {
            return false;
        }
        guard.absorb_right(&mut right);
        right.mark_dead();
        drop(right);
        trace!(fence = ?high_fence, "leaf merge");
        self.leaves.write().remove(&high_fence);
        true
    }
}
