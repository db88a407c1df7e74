//! Rollback.
//!
//! The transaction manager replays an aborting transaction's WAL records
//! newest-first through [`VersionedTree::undo_record`]. Undo never emits
//! WAL, and it only runs for rollback of a live transaction, never for
//! recovery. Observing a held write lock here is a broken invariant: the
//! aborting worker is the only one who could hold it.

use tracing::trace;

use crate::btree::{ChainIterator, ExclusiveIterator};
use crate::primitives::wal::WalRecord;
use crate::txn::Worker;

use super::fat::FatTuple;
use super::tuple::{self, TupleFormat, UpdateDescriptor};
use super::VersionedTree;

impl VersionedTree {
    /// Reverses one WAL record of the worker's aborting transaction.
    pub(crate) fn undo_record(&self, worker: &Worker, record: &WalRecord) {
        match record {
            WalRecord::Insert { key, .. } => self.undo_insert(key),
            WalRecord::Update {
                key,
                before_worker_id,
                before_commit_mark,
                descriptor,
                xor_diff,
                ..
            } => self.undo_update(
                worker,
                key,
                *before_worker_id,
                *before_commit_mark,
                descriptor,
                xor_diff,
            ),
            WalRecord::Remove { key, .. } => self.undo_remove(worker, key),
        }
    }

    /// INSERT undo: physically delete the primary slot.
    fn undo_insert(&self, user_key: &[u8]) {
        let key = tuple::compose_key(user_key, 0);
        let mut iter = ExclusiveIterator::new(self.btree());
        let found = iter.seek_exact(&key);
        assert!(found, "undo of insert found no primary slot");
        iter.remove_current();
        iter.mark_as_dirty();
        iter.merge_if_needed();
        trace!(key = ?user_key, "undo insert");
    }

    fn undo_update(
        &self,
        worker: &Worker,
        user_key: &[u8],
        before_worker: crate::types::WorkerId,
        before_mark: crate::types::CommitMark,
        descriptor: &UpdateDescriptor,
        xor_diff: &[u8],
    ) {
        let mut key = tuple::compose_key(user_key, 0);
        let mut iter = ExclusiveIterator::new(self.btree());
        let found = iter.seek_exact(&key);
        assert!(found, "undo of update found no primary slot");
        assert!(
            !tuple::is_write_locked(iter.value()),
            "write lock held at undo time"
        );

        // Fat tuples revert by popping their newest delta.
        if tuple::format(iter.value()).expect("valid tuple format") == TupleFormat::Fat {
            let mut fat = FatTuple::decode(iter.value()).expect("valid fat tuple");
            fat.undo_last_update().expect("fat tuple holds the update to undo");
            iter.replace_value(fat.encode());
            iter.mark_as_dirty();
            trace!(key = ?user_key, "undo fat update");
            return;
        }

        // Single-version mode: restore the stamp and re-XOR the diff.
        if !self.config().enable_mvcc || self.config().update_in_place {
            let head = iter.mutable_value();
            tuple::set_stamp(head, before_worker, before_mark);
            tuple::apply_xor_diff(descriptor, tuple::primary_payload_mut(head), xor_diff);
            iter.mark_as_dirty();
            trace!(key = ?user_key, "undo in-place update");
            return;
        }

        // Chained: the head must still be this transaction's version. Its
        // newest secondary carries the delta that reverts it.
        {
            let head = iter.mutable_value();
            let (head_worker, head_mark) = tuple::stamp(head);
            assert_eq!(head_worker, worker.worker_id(), "chained undo on foreign head");
            assert_eq!(head_mark, worker.tts(), "chained undo on foreign head");
            tuple::write_lock(head);
        }
        let undo_sn = tuple::next_sn(iter.value());
        assert_ne!(undo_sn, 0, "chained update left no secondary to undo from");
        iter.mark_as_dirty();

        tuple::set_key_sn(&mut key, undo_sn);
        let found = iter.seek_exact_with_hint(&key, true);
        assert!(found, "undo secondary vanished before rollback");
        let secondary = iter.value().to_vec();

        tuple::set_key_sn(&mut key, 0);
        let found = iter.seek_exact_with_hint(&key, false);
        assert!(found, "primary vanished during rollback");
        let payload = tuple::version_payload(&secondary);
        let (delta_descriptor, consumed) =
            UpdateDescriptor::decode(payload).expect("valid secondary delta");
        let head = iter.mutable_value();
        tuple::apply_diff(
            &delta_descriptor,
            tuple::primary_payload_mut(head),
            &payload[consumed..],
        );
        let (prev_worker, prev_mark) = tuple::stamp(&secondary);
        tuple::set_stamp(head, prev_worker, prev_mark);
        tuple::set_next_sn(head, tuple::next_sn(&secondary));
        if worker.is_serializable() && self.config().use_2pl {
            let bitmap = tuple::read_lock_bitmap(head) & !worker.worker_id().mask();
            tuple::set_read_lock_bitmap(head, bitmap);
        }
        tuple::write_unlock(head);
        iter.mark_as_dirty();
        // The consumed secondary is intentionally retained: readers whose
        // walk is already past the primary still find it, and GC reclaims it
        // once dominated.
        trace!(key = ?user_key, undo_sn, "undo chained update");
    }

    /// REMOVE undo: rebuild the primary from the image secondary, then
    /// delete the secondary.
    fn undo_remove(&self, worker: &Worker, user_key: &[u8]) {
        let mut key = tuple::compose_key(user_key, 0);
        let mut iter = ExclusiveIterator::new(self.btree());
        let found = iter.seek_exact(&key);
        assert!(found, "undo of remove found no tombstone");

        let secondary_sn;
        {
            let head = iter.mutable_value();
            let (head_worker, head_mark) = tuple::stamp(head);
            assert_eq!(head_worker, worker.worker_id(), "remove undo on foreign head");
            assert_eq!(head_mark, worker.tts(), "remove undo on foreign head");
            assert!(!tuple::is_write_locked(head), "write lock held at undo time");
            secondary_sn = tuple::next_sn(head);
            tuple::write_lock(head);
        }
        assert_ne!(secondary_sn, 0, "tombstone lost its image secondary");

        tuple::set_key_sn(&mut key, secondary_sn);
        let found = iter.seek_exact_with_hint(&key, true);
        assert!(found, "image secondary vanished before rollback");
        let secondary = iter.value().to_vec();
        let image = tuple::version_payload(&secondary);
        let (prev_worker, prev_mark) = tuple::stamp(&secondary);
        let undo_next_sn = tuple::next_sn(&secondary);
        iter.mark_as_dirty();

        // Resize the tombstone back to the original value and rebuild it.
        tuple::set_key_sn(&mut key, 0);
        let found = iter.seek_exact_with_hint(&key, false);
        assert!(found, "tombstone vanished during rollback");
        let new_len = tuple::PRIMARY_HEADER_LEN + image.len();
        if iter.value().len() < new_len {
            iter.extend_payload(new_len);
        } else {
            iter.shorten(new_len);
        }
        let restored = tuple::encode_primary(prev_worker, prev_mark, image);
        let head = iter.mutable_value();
        head.copy_from_slice(&restored);
        tuple::set_next_sn(head, undo_next_sn);
        debug_assert!(!tuple::is_removed(head));
        iter.mark_as_dirty();

        tuple::set_key_sn(&mut key, secondary_sn);
        let found = iter.seek_exact_with_hint(&key, true);
        assert!(found, "image secondary vanished during rollback");
        let freed = iter.leaf().kv_consumed_space(iter.cur);
        let leaf = iter.leaf_mut();
        leaf.gc_space_used = leaf.gc_space_used.saturating_sub(freed);
        iter.remove_current();
        iter.mark_as_dirty();
        trace!(key = ?user_key, "undo remove");
    }
}
