//! Fat tuples: a version chain packed into one slot.
//!
//! A fat tuple keeps the current value plus a newest-first list of
//! per-attribute deltas, each entry capturing the bytes an update overwrote
//! together with the stamp of the version it reverts to. Logically it is a
//! chain of delta secondaries without the pointer-chasing, and it makes
//! undoing the most recent update a pop.

use tracing::trace;

use crate::btree::{ChainIterator, ExclusiveIterator};
use crate::primitives::wal::WalRecord;
use crate::txn::Worker;
use crate::types::{CadenaError, CommitMark, Result, Sat, WorkerId};

use super::tuple::{self, UpdateDescriptor, FORMAT_FAT, TUPLE_HEADER_LEN};
use super::VersionedTree;

/// One reverted update: applying `old_bytes` under `descriptor` to the next
/// newer state yields the version stamped `(worker_id, commit_mark)`.
#[derive(Clone, Debug)]
pub struct FatDelta {
    pub worker_id: WorkerId,
    pub commit_mark: CommitMark,
    /// SAT watermark under which this version was superseded; `u64::MAX`
    /// when the superseding transaction rewrote its own version.
    pub sat: Sat,
    pub descriptor: UpdateDescriptor,
    pub old_bytes: Vec<u8>,
}

/// Decoded fat tuple. Mutated as a value and re-encoded into the slot.
#[derive(Clone, Debug)]
pub struct FatTuple {
    pub worker_id: WorkerId,
    pub commit_mark: CommitMark,
    pub read_lock_bitmap: u64,
    pub read_ts: u64,
    /// The current (newest) full value.
    pub value: Vec<u8>,
    /// Reverted updates, newest first.
    pub deltas: Vec<FatDelta>,
}

impl FatTuple {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let header = tuple::TupleHeader::parse(buf)?;
        if header.format != tuple::TupleFormat::Fat {
            return Err(CadenaError::Corruption("expected a fat tuple"));
        }
        let body = &buf[TUPLE_HEADER_LEN..];
        if body.len() < 4 {
            return Err(CadenaError::Corruption("fat tuple truncated"));
        }
        let value_len =
            u32::from_be_bytes(body[0..4].try_into().expect("len checked")) as usize;
        if body.len() < 4 + value_len + 2 {
            return Err(CadenaError::Corruption("fat tuple value truncated"));
        }
        let value = body[4..4 + value_len].to_vec();
        let mut at = 4 + value_len;
        let delta_count =
            u16::from_be_bytes(body[at..at + 2].try_into().expect("len checked")) as usize;
        at += 2;
        let mut deltas = Vec::with_capacity(delta_count);
        for _ in 0..delta_count {
            if body.len() < at + 17 {
                return Err(CadenaError::Corruption("fat delta header truncated"));
            }
            let worker_id = WorkerId(body[at]);
            let commit_mark =
                u64::from_be_bytes(body[at + 1..at + 9].try_into().expect("len checked"));
            let sat = u64::from_be_bytes(body[at + 9..at + 17].try_into().expect("len checked"));
            at += 17;
            let (descriptor, consumed) = UpdateDescriptor::decode(&body[at..])?;
            at += consumed;
            let diff_len = descriptor.diff_len();
            if body.len() < at + diff_len {
                return Err(CadenaError::Corruption("fat delta diff truncated"));
            }
            let old_bytes = body[at..at + diff_len].to_vec();
            at += diff_len;
            deltas.push(FatDelta {
                worker_id,
                commit_mark,
                sat,
                descriptor,
                old_bytes,
            });
        }
        Ok(Self {
            worker_id: header.worker_id,
            commit_mark: header.commit_mark,
            read_lock_bitmap: header.read_lock_bitmap,
            read_ts: header.read_ts,
            value,
            deltas,
        })
    }

    /// Encodes the tuple with an unlocked header.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; TUPLE_HEADER_LEN];
        buf[0] = FORMAT_FAT;
        tuple::set_stamp(&mut buf, self.worker_id, self.commit_mark);
        tuple::set_read_lock_bitmap(&mut buf, self.read_lock_bitmap);
        tuple::set_read_ts(&mut buf, self.read_ts);
        let value_len = u32::try_from(self.value.len()).expect("value fits u32");
        buf.extend_from_slice(&value_len.to_be_bytes());
        buf.extend_from_slice(&self.value);
        let delta_count = u16::try_from(self.deltas.len()).expect("delta count fits u16");
        buf.extend_from_slice(&delta_count.to_be_bytes());
        for delta in &self.deltas {
            buf.push(delta.worker_id.0);
            buf.extend_from_slice(&delta.commit_mark.to_be_bytes());
            buf.extend_from_slice(&delta.sat.to_be_bytes());
            delta.descriptor.encode_into(&mut buf);
            buf.extend_from_slice(&delta.old_bytes);
        }
        buf
    }

    /// Pushes a delta reverting the current value, then restamps.
    fn push_update(
        &mut self,
        worker_id: WorkerId,
        commit_mark: CommitMark,
        sat: Sat,
        descriptor: &UpdateDescriptor,
    ) {
        let mut old_bytes = Vec::with_capacity(descriptor.diff_len());
        tuple::generate_diff(descriptor, &mut old_bytes, &self.value);
        self.deltas.insert(
            0,
            FatDelta {
                worker_id: self.worker_id,
                commit_mark: self.commit_mark,
                sat,
                descriptor: descriptor.clone(),
                old_bytes,
            },
        );
        self.worker_id = worker_id;
        self.commit_mark = commit_mark;
    }

    /// Pops the newest delta, restoring the previous value and stamp. Used
    /// by rollback.
    pub fn undo_last_update(&mut self) -> Result<()> {
        let delta = self
            .deltas
            .first()
            .cloned()
            .ok_or(CadenaError::Corruption("fat tuple has no delta to undo"))?;
        self.deltas.remove(0);
        tuple::apply_diff(&delta.descriptor, &mut self.value, &delta.old_bytes);
        self.worker_id = delta.worker_id;
        self.commit_mark = delta.commit_mark;
        Ok(())
    }

    /// Drops every delta dominated by the low-water mark: once a delta's
    /// superseding SAT is visible to all, no snapshot can reach it or
    /// anything older.
    fn prune(&mut self, lwm: u64) {
        if let Some(cut) = self.deltas.iter().position(|d| d.sat <= lwm) {
            self.deltas.truncate(cut);
        }
    }
}

/// Reconstructs the value visible to the worker's snapshot by replaying
/// deltas newest-first.
pub(crate) fn reconstruct_fat(worker: &Worker, buf: &[u8]) -> Result<Option<Vec<u8>>> {
    let fat = FatTuple::decode(buf)?;
    if worker.is_visible_for_me(fat.worker_id, fat.commit_mark) {
        return Ok(Some(fat.value));
    }
    let mut value = fat.value;
    for delta in &fat.deltas {
        delta.descriptor.validate_against(value.len())?;
        tuple::apply_diff(&delta.descriptor, &mut value, &delta.old_bytes);
        if worker.is_visible_for_me(delta.worker_id, delta.commit_mark) {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

impl VersionedTree {
    /// Applies an update to a fat tuple: capture the before-bytes as a new
    /// delta, emit the WAL record, apply the callback, prune if the delta
    /// list is over its cap. The caller holds the head write lock.
    pub(crate) fn fat_update(
        &self,
        worker: &mut Worker,
        iter: &mut ExclusiveIterator<'_>,
        user_key: &[u8],
        update_fn: &mut dyn FnMut(&mut [u8]),
        descriptor: &UpdateDescriptor,
    ) -> Result<()> {
        let mut fat = FatTuple::decode(iter.value())?;
        descriptor.validate_against(fat.value.len())?;
        let before_worker = fat.worker_id;
        let before_mark = fat.commit_mark;
        let own_head = before_worker == worker.worker_id() && before_mark == worker.tts();
        let superseded_sat = if own_head { u64::MAX } else { worker.tts() };

        let mut scratch = fat.value.clone();
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

        fat.push_update(worker.worker_id(), worker.tts(), superseded_sat, descriptor);
        fat.value = scratch;
        if fat.deltas.len() >= self.config().fat_tuple_max_deltas {
            let before = fat.deltas.len();
            fat.prune(worker.registry().low_water_mark());
            trace!(before, after = fat.deltas.len(), "pruned fat tuple deltas");
        }
        iter.replace_value(fat.encode());
        iter.mark_as_dirty();
        Ok(())
    }

    /// Converts a chained tuple into a fat tuple: the live payload stays,
    /// delta secondaries fold into the delta list newest-first and their
    /// slots are freed. Returns `false` (leaving the chain untouched) when a
    /// full-image secondary interrupts the walk. The caller holds the head
    /// write lock and re-seeks afterwards.
    pub(crate) fn convert_chained_to_fat(
        &self,
        iter: &mut ExclusiveIterator<'_>,
        user_key: &[u8],
    ) -> Result<bool> {
        let head = iter.value();
        debug_assert!(tuple::is_write_locked(head));
        let header = tuple::TupleHeader::parse(head)?;
        let mut fat = FatTuple {
            worker_id: header.worker_id,
            commit_mark: header.commit_mark,
            read_lock_bitmap: header.read_lock_bitmap,
            read_ts: header.read_ts,
            value: tuple::primary_payload(head).to_vec(),
            deltas: Vec::new(),
        };
        let mut key = tuple::compose_key(user_key, 0);
        let mut consumed = Vec::new();
        let mut sn = tuple::next_sn(head);
        let mut aborted = false;
        while sn != 0 {
            tuple::set_key_sn(&mut key, sn);
            if !iter.seek_exact_with_hint(&key, true) {
                break;
            }
            let version = iter.value();
            let vh = tuple::TupleHeader::parse(version)?;
            if !vh.is_delta {
                // A full prior image (pre-remove state) has no per-attribute
                // encoding; leave this chain alone.
                aborted = true;
                break;
            }
            let payload = tuple::version_payload(version);
            let (descriptor, used) = UpdateDescriptor::decode(payload)?;
            fat.deltas.push(FatDelta {
                worker_id: vh.worker_id,
                commit_mark: vh.commit_mark,
                sat: tuple::committed_before_sat(version),
                descriptor,
                old_bytes: payload[used..].to_vec(),
            });
            consumed.push(sn);
            sn = tuple::next_sn(version);
        }
        if aborted {
            tuple::set_key_sn(&mut key, 0);
            let found = iter.seek_exact_with_hint(&key, false);
            assert!(found, "primary vanished during fat conversion");
            tuple::set_convertible(iter.mutable_value(), false);
            return Ok(false);
        }

        for &gone in &consumed {
            tuple::set_key_sn(&mut key, gone);
            if iter.seek_exact_with_hint(&key, true) {
                let freed = iter.leaf().kv_consumed_space(iter.cur);
                let leaf = iter.leaf_mut();
                leaf.gc_space_used = leaf.gc_space_used.saturating_sub(freed);
                iter.remove_current();
            }
        }

        tuple::set_key_sn(&mut key, 0);
        let found = iter.seek_exact_with_hint(&key, false);
        assert!(found, "primary vanished during fat conversion");
        iter.replace_value(fat.encode());
        iter.mark_as_dirty();
        iter.merge_if_needed();
        Ok(true)
    }
}
