//! The multi-version index: transactional operations over chained and fat
//! tuples co-resident in B-Tree leaves.
//!
//! Writers extend a per-key version chain anchored at the primary tuple
//! (`sn = 0`); readers reconstruct the value visible to their snapshot by
//! walking it. Every write emits a rollback record and, when it creates
//! garbage, stages a deferred GC item carrying a stamped dangling-pointer
//! capability back to the touched slots.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::btree::{BTree, ChainIterator, ExclusiveIterator, InsertOutcome, SeekInsert, SharedIterator};
use crate::config::Config;
use crate::primitives::wal::WalRecord;
use crate::txn::Worker;
use crate::types::{CadenaError, ChainSn, Result, WorkerId};

pub mod fat;
pub mod gc;
pub mod reconstruct;
pub mod tuple;
pub mod undo;

use gc::{DanglingPointer, GcTodo};
use tuple::{TupleFormat, TupleHeader, UpdateDescriptor};

/// The multi-version B-Tree index.
pub struct VersionedTree {
    btree: BTree,
    config: Arc<Config>,
    gc_counters: gc::GcCounters,
}

impl VersionedTree {
    pub fn new(config: Arc<Config>) -> Self {
        let btree = BTree::new(config.leaf_capacity);
        Self {
            btree,
            config,
            gc_counters: gc::GcCounters::default(),
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub(crate) fn btree(&self) -> &BTree {
        &self.btree
    }

    /// Number of leaves currently in the tree.
    pub fn leaf_count(&self) -> usize {
        self.btree.leaf_count()
    }

    /// Total physical slots across all leaves: primaries, secondaries, and
    /// tombstones. Diagnostics and tests; takes shared latches leaf by leaf.
    pub fn physical_slot_count(&self) -> usize {
        let mut total = 0;
        let mut cursor = self.btree.leaf_at_or_after(&[]);
        while let Some((fence, leaf_ref)) = cursor {
            {
                let guard = leaf_ref.read();
                if !guard.is_dead() {
                    total += guard.slot_count();
                }
            }
            cursor = self.btree.leaf_after(&fence);
        }
        total
    }

    /// Format of the primary tuple stored under `user_key`, if any.
    pub fn tuple_format(&self, user_key: &[u8]) -> Option<TupleFormat> {
        let key = tuple::compose_key(user_key, 0);
        let (_, guard) = self.btree.leaf_shared(&key);
        let slot = guard.search(&key).ok()?;
        tuple::format(guard.value(slot)).ok()
    }

    /// Auto-commits (or auto-aborts) single-statement transactions.
    fn finish_statement<T>(&self, worker: &mut Worker, result: Result<T>) -> Result<T> {
        if worker.is_single_statement() {
            match &result {
                Ok(_) => worker.commit(self)?,
                Err(_) => {
                    let _ = worker.abort(self);
                }
            }
        }
        result
    }

    /// Looks up the value of `user_key` visible to the worker's snapshot.
    ///
    /// Serializable transactions go straight to the pessimistic path so read
    /// metadata can be recorded; everyone else tries the optimistic
    /// primary-visible fast path first.
    pub fn lookup(&self, worker: &mut Worker, user_key: &[u8]) -> Result<Option<Vec<u8>>> {
        worker.ensure_tx();
        let result = self.lookup_inner(worker, user_key);
        self.finish_statement(worker, result)
    }

    fn lookup_inner(&self, worker: &mut Worker, user_key: &[u8]) -> Result<Option<Vec<u8>>> {
        if worker.is_serializable() {
            return self.lookup_pessimistic(worker, user_key);
        }
        match self.lookup_optimistic(worker, user_key) {
            Some(result) => result,
            None => self.lookup_pessimistic(worker, user_key),
        }
    }

    /// One non-blocking attempt covering only the primary-visible case.
    /// `None` sends the caller to the pessimistic path.
    fn lookup_optimistic(
        &self,
        worker: &Worker,
        user_key: &[u8],
    ) -> Option<Result<Option<Vec<u8>>>> {
        let key = tuple::compose_key(user_key, 0);
        let (_, guard) = self.btree.try_leaf_shared(&key)?;
        let slot = match guard.search(&key) {
            Ok(slot) => slot,
            Err(_) => return Some(Ok(None)),
        };
        let buf = guard.value(slot);
        let header = match TupleHeader::parse(buf) {
            Ok(header) => header,
            Err(err) => return Some(Err(err)),
        };
        if header.write_locked || !worker.is_visible_for_me(header.worker_id, header.commit_mark) {
            return None;
        }
        match header.format {
            TupleFormat::Chained => {
                if header.is_removed {
                    Some(Ok(None))
                } else {
                    Some(Ok(Some(tuple::primary_payload(buf).to_vec())))
                }
            }
            TupleFormat::Fat => Some(fat::reconstruct_fat(worker, buf)),
        }
    }

    fn lookup_pessimistic(&self, worker: &mut Worker, user_key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut key = tuple::compose_key(user_key, 0);
        if worker.is_serializable() {
            let mut iter = ExclusiveIterator::new(&self.btree);
            if !iter.seek_exact(&key) {
                return Ok(None);
            }
            self.record_read_metadata(worker, &mut iter, user_key)?;
            reconstruct::reconstruct(worker, &self.config, &mut iter, &mut key)
        } else {
            let mut iter = SharedIterator::new(&self.btree);
            if !iter.seek_exact(&key) {
                return Ok(None);
            }
            reconstruct::reconstruct(worker, &self.config, &mut iter, &mut key)
        }
    }

    /// Stamps SSI read metadata on the primary: the 2PL bitmap bit or the
    /// read-timestamp watermark.
    fn record_read_metadata(
        &self,
        worker: &mut Worker,
        iter: &mut ExclusiveIterator<'_>,
        user_key: &[u8],
    ) -> Result<()> {
        let buf = iter.mutable_value();
        TupleHeader::parse(buf)?;
        if self.config.use_2pl {
            let bitmap = tuple::read_lock_bitmap(buf) | worker.worker_id().mask();
            tuple::set_read_lock_bitmap(buf, bitmap);
            worker.note_read_lock(user_key);
        } else {
            let ts = tuple::read_ts(buf).max(worker.tts());
            tuple::set_read_ts(buf, ts);
        }
        Ok(())
    }

    /// Inserts a fresh primary tuple.
    pub fn insert(&self, worker: &mut Worker, user_key: &[u8], value: &[u8]) -> Result<()> {
        worker.ensure_tx();
        let result = self.insert_inner(worker, user_key, value);
        self.finish_statement(worker, result)
    }

    fn insert_inner(&self, worker: &mut Worker, user_key: &[u8], value: &[u8]) -> Result<()> {
        worker.wal_ensure_enough_space(self.config.leaf_capacity + user_key.len())?;
        let key = tuple::compose_key(user_key, 0);
        let payload_len = tuple::PRIMARY_HEADER_LEN + value.len();
        let mut iter = ExclusiveIterator::new(&self.btree);
        loop {
            if iter.seek_to_insert(&key) == SeekInsert::Duplicate {
                let head = iter.value();
                let header = TupleHeader::parse(head)?;
                if header.write_locked
                    || !worker.is_visible_for_me(header.worker_id, header.commit_mark)
                {
                    return Err(CadenaError::AbortTx);
                }
                if header.is_removed {
                    // The tombstone has not been collected yet; reusing the
                    // key would have to splice a fresh head onto the old
                    // chain, which is not implemented upstream either.
                    return Err(CadenaError::Unsupported(
                        "insert over an un-collected tombstone",
                    ));
                }
                return Err(CadenaError::Duplicate);
            }
            if !iter.enough_space_in_current_node(&key, payload_len) && iter.split_for_key(&key) {
                continue;
            }
            worker.wal_append(WalRecord::Insert {
                key: user_key.to_vec(),
                value: value.to_vec(),
            })?;
            let primary = tuple::encode_primary(worker.worker_id(), worker.tts(), value);
            iter.insert_in_current_node(&key, primary);
            trace!(key = ?user_key, "insert");
            return Ok(());
        }
    }

    /// Applies `update_fn` to the payload of `user_key` under the update
    /// descriptor, extending the version chain (or the fat tuple's delta
    /// list) with the prior image.
    pub fn update(
        &self,
        worker: &mut Worker,
        user_key: &[u8],
        mut update_fn: impl FnMut(&mut [u8]),
        descriptor: &UpdateDescriptor,
    ) -> Result<()> {
        worker.ensure_tx();
        let result = self.update_inner(worker, user_key, &mut update_fn, descriptor);
        self.finish_statement(worker, result)
    }

    fn update_inner(
        &self,
        worker: &mut Worker,
        user_key: &[u8],
        update_fn: &mut dyn FnMut(&mut [u8]),
        descriptor: &UpdateDescriptor,
    ) -> Result<()> {
        worker.wal_ensure_enough_space(self.config.leaf_capacity + user_key.len())?;
        let mut key = tuple::compose_key(user_key, 0);
        let mut iter = ExclusiveIterator::new(&self.btree);
        if !iter.seek_exact(&key) {
            return Err(CadenaError::NotFound);
        }
        loop {
            let header = TupleHeader::parse(iter.value())?;
            if header.write_locked
                || !worker.is_visible_for_me(header.worker_id, header.commit_mark)
            {
                return Err(CadenaError::AbortTx);
            }
            if worker.is_serializable() {
                if self.config.use_2pl {
                    let others = header.read_lock_bitmap & !worker.worker_id().mask();
                    if others != 0 {
                        return Err(CadenaError::AbortTx);
                    }
                } else if header.read_ts > worker.tts() {
                    return Err(CadenaError::AbortTx);
                }
            }
            tuple::write_lock(iter.mutable_value());

            if header.format == TupleFormat::Fat {
                self.fat_update(worker, &mut iter, user_key, update_fn, descriptor)?;
                tuple::write_unlock(iter.mutable_value());
                iter.contention_split();
                return Ok(());
            }

            if !self.config.enable_mvcc || self.config.update_in_place {
                self.update_single_version(worker, &mut iter, user_key, update_fn, descriptor)?;
                iter.contention_split();
                return Ok(());
            }

            // Probabilistic conversion of a hot chain into a fat tuple.
            let head = iter.value();
            let (head_worker, head_mark) = tuple::stamp(head);
            let own_head = head_worker == worker.worker_id() && head_mark == worker.tts();
            let mut convert =
                self.config.fat_tuple && tuple::is_convertible(head) && !own_head;
            if convert {
                convert = worker.fat_coin(self.config.fat_tuple_threshold);
            }
            if convert && self.convert_chained_to_fat(&mut iter, user_key)? {
                debug!(key = ?user_key, "converted chain to fat tuple");
                // The rewritten head is unlocked; re-run the checks.
                let found = iter.seek_exact(&key);
                debug_assert!(found, "fat conversion kept the primary slot");
                continue;
            }

            return self.update_chained(worker, &mut iter, &mut key, user_key, update_fn, descriptor);
        }
    }

    /// In-place update for single-version mode: the WAL XOR-diff alone
    /// carries the prior image.
    fn update_single_version(
        &self,
        worker: &mut Worker,
        iter: &mut ExclusiveIterator<'_>,
        user_key: &[u8],
        update_fn: &mut dyn FnMut(&mut [u8]),
        descriptor: &UpdateDescriptor,
    ) -> Result<()> {
        let head = iter.value();
        let (before_worker, before_mark) = tuple::stamp(head);
        let payload = tuple::primary_payload(head);
        descriptor.validate_against(payload.len())?;
        let mut scratch = payload.to_vec();
        let mut xor = Vec::with_capacity(descriptor.diff_len());
        tuple::generate_diff(descriptor, &mut xor, &scratch);
        update_fn(&mut scratch);
        tuple::generate_xor_diff(descriptor, &mut xor, &scratch);
        worker.wal_append(WalRecord::Update {
            key: user_key.to_vec(),
            before_worker_id: before_worker,
            before_commit_mark: before_mark,
            after_worker_id: worker.worker_id(),
            after_commit_mark: worker.tts(),
            descriptor: descriptor.clone(),
            xor_diff: xor,
        })?;
        let head_mut = iter.mutable_value();
        tuple::primary_payload_mut(head_mut).copy_from_slice(&scratch);
        tuple::set_stamp(head_mut, worker.worker_id(), worker.tts());
        tuple::write_unlock(head_mut);
        Ok(())
    }

    /// Chained MVCC update: the prior image moves into a fresh secondary,
    /// the primary is rewritten in place.
    fn update_chained(
        &self,
        worker: &mut Worker,
        iter: &mut ExclusiveIterator<'_>,
        key: &mut [u8],
        user_key: &[u8],
        update_fn: &mut dyn FnMut(&mut [u8]),
        descriptor: &UpdateDescriptor,
    ) -> Result<()> {
        // Build the secondary carrying the descriptor and the before-bytes
        // of the touched attributes.
        let head = iter.value();
        let head_payload = tuple::primary_payload(head);
        descriptor.validate_against(head_payload.len())?;
        let (head_worker, head_mark) = tuple::stamp(head);
        let head_next = tuple::next_sn(head);
        let mut secondary_payload =
            Vec::with_capacity(descriptor.encoded_len() + descriptor.diff_len());
        descriptor.encode_into(&mut secondary_payload);
        tuple::generate_diff(descriptor, &mut secondary_payload, head_payload);
        let own_head = head_worker == worker.worker_id() && head_mark == worker.tts();
        let committed_before_sat = if own_head { u64::MAX } else { worker.tts() };
        let secondary = tuple::encode_version(
            head_worker,
            head_mark,
            true,
            head_next,
            committed_before_sat,
            worker.tts(),
            &secondary_payload,
        );

        // Stamp the GC capability before the insert can relatch anything.
        let mut dangling = DanglingPointer::stamped(
            iter.leaf_handle(),
            iter.latch_version_after_release(),
            iter.cur,
            false,
        );
        iter.mark_as_dirty();

        let mut sn = worker.random_sn(if head_next <= 1 { ChainSn::MAX } else { head_next });
        let mut version_key = tuple::compose_key(user_key, sn);
        loop {
            tuple::set_key_sn(&mut version_key, sn);
            match iter.insert_kv(&version_key, secondary.clone()) {
                InsertOutcome::Inserted => break,
                InsertOutcome::KeyExists => sn = worker.random_sn(ChainSn::MAX),
            }
        }
        let secondary_space = iter.leaf().kv_consumed_space(iter.cur);
        iter.leaf_mut().gc_space_used += secondary_space;
        iter.mark_as_dirty();

        // Return to the head: through the capability when the insert stayed
        // on the same latched leaf, by key otherwise.
        tuple::set_key_sn(key, 0);
        if dangling.revalidate(iter, key) {
            dangling.secondary_slot = iter.cur;
            dangling.valid = true;
            debug_assert!(dangling.secondary_slot > dangling.head_slot);
            iter.cur = dangling.head_slot;
        } else {
            let found = iter.seek_exact_with_hint(key, false);
            assert!(found, "primary vanished under the leaf latch");
        }

        // WAL entry with before-image descriptor and XOR-diff, then the
        // in-place mutation.
        let head = iter.value();
        let (before_worker, before_mark) = tuple::stamp(head);
        let mut scratch = tuple::primary_payload(head).to_vec();
        let mut xor = Vec::with_capacity(descriptor.diff_len());
        tuple::generate_diff(descriptor, &mut xor, &scratch);
        update_fn(&mut scratch);
        tuple::generate_xor_diff(descriptor, &mut xor, &scratch);
        worker.wal_append(WalRecord::Update {
            key: user_key.to_vec(),
            before_worker_id: before_worker,
            before_commit_mark: before_mark,
            after_worker_id: worker.worker_id(),
            after_commit_mark: worker.tts(),
            descriptor: descriptor.clone(),
            xor_diff: xor,
        })?;
        let head_mut = iter.mutable_value();
        tuple::primary_payload_mut(head_mut).copy_from_slice(&scratch);
        tuple::set_stamp(head_mut, worker.worker_id(), worker.tts());
        tuple::set_next_sn(head_mut, sn);
        if worker.is_serializable() {
            if self.config.use_2pl {
                tuple::set_read_lock_bitmap(head_mut, worker.worker_id().mask());
                worker.note_read_lock(user_key);
            } else {
                tuple::set_read_ts(head_mut, worker.tts());
            }
        }

        if self.config.stage_update_todos {
            worker.stage_todo(GcTodo {
                worker_id: worker.worker_id(),
                tts: worker.tts(),
                user_key: user_key.to_vec(),
                sn,
                dangling,
            });
        }

        tuple::write_unlock(iter.mutable_value());
        iter.contention_split();
        trace!(key = ?user_key, sn, "chained update");
        Ok(())
    }

    /// Removes `user_key`: the full prior image moves into a secondary and
    /// the primary shrinks to a tombstone. Physical removal is behind a
    /// config flag; fat tuples cannot be removed.
    pub fn remove(&self, worker: &mut Worker, user_key: &[u8]) -> Result<()> {
        worker.ensure_tx();
        let result = self.remove_inner(worker, user_key);
        self.finish_statement(worker, result)
    }

    fn remove_inner(&self, worker: &mut Worker, user_key: &[u8]) -> Result<()> {
        worker.wal_ensure_enough_space(self.config.leaf_capacity + user_key.len())?;
        let mut key = tuple::compose_key(user_key, 0);
        let mut iter = ExclusiveIterator::new(&self.btree);
        if !iter.seek_exact(&key) {
            return Err(CadenaError::NotFound);
        }
        if self.config.physical_remove {
            iter.remove_current();
            iter.merge_if_needed();
            return Ok(());
        }

        let header = TupleHeader::parse(iter.value())?;
        if header.format == TupleFormat::Fat {
            return Err(CadenaError::Unsupported("removing a fat tuple"));
        }
        if header.write_locked || !worker.is_visible_for_me(header.worker_id, header.commit_mark)
        {
            return Err(CadenaError::AbortTx);
        }
        if worker.is_serializable() {
            if self.config.use_2pl {
                let others = header.read_lock_bitmap & !worker.worker_id().mask();
                if others != 0 {
                    return Err(CadenaError::AbortTx);
                }
            } else if header.read_ts > worker.tts() {
                return Err(CadenaError::AbortTx);
            }
        }
        if header.is_removed {
            return Err(CadenaError::NotFound);
        }
        tuple::write_lock(iter.mutable_value());

        // Full prior image into a non-delta secondary.
        let head = iter.value();
        let value = tuple::primary_payload(head).to_vec();
        let head_next = tuple::next_sn(head);
        let secondary = tuple::encode_version(
            header.worker_id,
            header.commit_mark,
            false,
            head_next,
            worker.tts(),
            worker.tts(),
            &value,
        );
        let mut dangling = DanglingPointer::stamped(
            iter.leaf_handle(),
            iter.latch_version_after_release(),
            iter.cur,
            true,
        );
        iter.mark_as_dirty();

        let mut sn = worker.random_sn(ChainSn::MAX);
        let mut version_key = tuple::compose_key(user_key, sn);
        loop {
            tuple::set_key_sn(&mut version_key, sn);
            match iter.insert_kv(&version_key, secondary.clone()) {
                InsertOutcome::Inserted => break,
                InsertOutcome::KeyExists => sn = worker.random_sn(ChainSn::MAX),
            }
        }
        let secondary_space = iter.leaf().kv_consumed_space(iter.cur);
        iter.leaf_mut().gc_space_used += secondary_space;
        iter.mark_as_dirty();

        tuple::set_key_sn(&mut key, 0);
        if dangling.revalidate(&iter, &key) {
            dangling.secondary_slot = iter.cur;
            dangling.valid = true;
            debug_assert!(dangling.secondary_slot > dangling.head_slot);
            iter.cur = dangling.head_slot;
        } else {
            let found = iter.seek_exact_with_hint(&key, false);
            assert!(found, "primary vanished under the leaf latch");
        }

        worker.wal_append(WalRecord::Remove {
            key: user_key.to_vec(),
            before_worker_id: header.worker_id,
            before_commit_mark: header.commit_mark,
            value,
        })?;

        // Shrink the primary to an empty tombstone pointing at the image.
        iter.shorten(tuple::PRIMARY_HEADER_LEN);
        let head_mut = iter.mutable_value();
        tuple::set_removed(head_mut, true);
        tuple::set_stamp(head_mut, worker.worker_id(), worker.tts());
        tuple::set_next_sn(head_mut, sn);
        if worker.is_serializable() {
            if self.config.use_2pl {
                tuple::set_read_lock_bitmap(head_mut, worker.worker_id().mask());
                worker.note_read_lock(user_key);
            } else {
                tuple::set_read_ts(head_mut, worker.tts());
            }
        }

        if self.config.stage_remove_todos {
            worker.stage_todo(GcTodo {
                worker_id: worker.worker_id(),
                tts: worker.tts(),
                user_key: user_key.to_vec(),
                sn,
                dangling,
            });
        }
        let tombstone_space = iter.leaf().kv_consumed_space(iter.cur);
        iter.leaf_mut().gc_space_used += tombstone_space;
        tuple::write_unlock(iter.mutable_value());
        trace!(key = ?user_key, sn, "remove");
        Ok(())
    }

    /// Ascending scan from `start` (inclusive, user-key order). The callback
    /// returns `false` to stop. Pages whose skip hint proves every head
    /// invisible to this snapshot are passed over without touching slots.
    pub fn scan_asc(
        &self,
        worker: &mut Worker,
        start: &[u8],
        mut callback: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        worker.ensure_tx();
        let result = self.scan_inner(worker, start, &mut callback, true);
        self.finish_statement(worker, result)
    }

    /// Descending scan from `start` (inclusive) toward the smallest key.
    pub fn scan_desc(
        &self,
        worker: &mut Worker,
        start: &[u8],
        mut callback: impl FnMut(&[u8], &[u8]) -> bool,
    ) -> Result<()> {
        worker.ensure_tx();
        let result = self.scan_inner(worker, start, &mut callback, false);
        self.finish_statement(worker, result)
    }

    fn scan_inner(
        &self,
        worker: &mut Worker,
        start: &[u8],
        callback: &mut dyn FnMut(&[u8], &[u8]) -> bool,
        ascending: bool,
    ) -> Result<()> {
        let start_key = tuple::compose_key(start, if ascending { 0 } else { ChainSn::MAX });
        let mut cursor = if ascending {
            self.btree.leaf_at_or_after(&start_key)
        } else {
            Some(
                self.btree
                    .leaf_at_or_after(&start_key)
                    .unwrap_or_else(|| self.btree.last_leaf()),
            )
        };
        // High-water mark of keys already handed to reconstruction; guards
        // against re-emission when a leaf merge forces a routing restart.
        let mut progress: Option<Vec<u8>> = None;
        while let Some((fence, leaf_ref)) = cursor {
            let mut keys = Vec::new();
            {
                let guard = leaf_ref.read();
                if guard.is_dead() {
                    // Merged away while unlatched; restart routing from the
                    // fence we were at.
                    cursor = if ascending {
                        self.btree.leaf_at_or_after(&fence)
                    } else {
                        self.btree.leaf_before(&fence)
                    };
                    continue;
                }
                if !guard.may_skip(worker.sat()) {
                    for slot in 0..guard.slot_count() {
                        let key = guard.key(slot);
                        if tuple::key_sn(key) != 0 {
                            continue;
                        }
                        let user = tuple::user_key(key);
                        if ascending && user < start {
                            continue;
                        }
                        if !ascending && user > start {
                            continue;
                        }
                        if let Some(past) = &progress {
                            if ascending && user <= past.as_slice() {
                                continue;
                            }
                            if !ascending && user >= past.as_slice() {
                                continue;
                            }
                        }
                        keys.push(user.to_vec());
                    }
                }
            }
            if !ascending {
                keys.reverse();
            }
            for user in keys {
                progress = Some(user.clone());
                let mut key = tuple::compose_key(&user, 0);
                let mut iter = SharedIterator::new(&self.btree);
                if !iter.seek_exact(&key) {
                    continue;
                }
                if let Some(value) =
                    reconstruct::reconstruct(worker, &self.config, &mut iter, &mut key)?
                {
                    drop(iter);
                    if !callback(&user, &value) {
                        return Ok(());
                    }
                }
            }
            cursor = if ascending {
                self.btree.leaf_after(&fence)
            } else {
                self.btree.leaf_before(&fence)
            };
        }
        Ok(())
    }

    /// Clears a worker's 2PL read-lock bit on the primary of `user_key`.
    /// Driven from commit/abort for every key the transaction read-locked.
    pub(crate) fn release_read_lock(&self, worker_id: WorkerId, user_key: &[u8]) {
        let key = tuple::compose_key(user_key, 0);
        let mut iter = ExclusiveIterator::new(&self.btree);
        if !iter.seek_exact(&key) {
            return;
        }
        let buf = iter.mutable_value();
        if TupleHeader::parse(buf).is_err() {
            return;
        }
        let bitmap = tuple::read_lock_bitmap(buf) & !worker_id.mask();
        tuple::set_read_lock_bitmap(buf, bitmap);
    }
}
