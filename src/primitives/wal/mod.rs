//! Per-worker rollback log.
//!
//! The engine only needs the WAL for transaction rollback: commit discards
//! the running transaction's records, abort drains them newest-first for
//! undo. Durability plumbing (segments, checksums, group commit) lives in
//! the host engine, not here; what is fixed here is the record contract and
//! the ahead-of-time space check that keeps write paths from failing
//! mid-flight.

use tracing::trace;

use crate::mvcc::tuple::UpdateDescriptor;
use crate::types::{CadenaError, CommitMark, Result, WorkerId};

/// Fixed per-record bookkeeping charged against the ring budget in addition
/// to key/payload bytes.
const RECORD_OVERHEAD: usize = 48;

/// A single rollback record. Field sets mirror what undo needs and nothing
/// more.
#[derive(Clone, Debug)]
pub enum WalRecord {
    /// A fresh primary tuple was written under `key`.
    Insert {
        key: Vec<u8>,
        value: Vec<u8>,
    },
    /// An in-place or chained update of the primary payload.
    Update {
        key: Vec<u8>,
        before_worker_id: WorkerId,
        before_commit_mark: CommitMark,
        after_worker_id: WorkerId,
        after_commit_mark: CommitMark,
        descriptor: UpdateDescriptor,
        /// `old XOR new` over the descriptor's slices; applying it twice is a
        /// no-op, applying it once flips the payload between the two states.
        xor_diff: Vec<u8>,
    },
    /// The primary was shrunk to a tombstone; `value` is the removed image.
    Remove {
        key: Vec<u8>,
        before_worker_id: WorkerId,
        before_commit_mark: CommitMark,
        value: Vec<u8>,
    },
}

impl WalRecord {
    /// Bytes this record charges against the ring budget.
    pub fn charged_len(&self) -> usize {
        let payload = match self {
            WalRecord::Insert { key, value } => key.len() + value.len(),
            WalRecord::Update {
                key,
                descriptor,
                xor_diff,
                ..
            } => key.len() + descriptor.encoded_len() + xor_diff.len(),
            WalRecord::Remove { key, value, .. } => key.len() + value.len(),
        };
        RECORD_OVERHEAD + payload
    }
}

/// Rollback log of one worker. Holds only the records of the currently
/// running transaction.
#[derive(Debug)]
pub struct WalRing {
    records: Vec<WalRecord>,
    bytes_used: usize,
    capacity: usize,
}

impl WalRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::new(),
            bytes_used: 0,
            capacity,
        }
    }

    /// Fails early when `bytes` more would not fit. Write paths call this
    /// before touching any page so they never have to unwind a half-applied
    /// mutation on WAL pressure.
    pub fn ensure_enough_space(&self, bytes: usize) -> Result<()> {
        if self.bytes_used + bytes > self.capacity {
            return Err(CadenaError::WalExhausted);
        }
        Ok(())
    }

    /// Appends a record for the running transaction.
    pub fn append(&mut self, record: WalRecord) -> Result<()> {
        let len = record.charged_len();
        if self.bytes_used + len > self.capacity {
            return Err(CadenaError::WalExhausted);
        }
        self.bytes_used += len;
        self.records.push(record);
        Ok(())
    }

    /// Number of records held for the running transaction.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Commit: the records are no longer needed for rollback.
    pub fn discard(&mut self) {
        trace!(records = self.records.len(), "wal discard on commit");
        self.records.clear();
        self.bytes_used = 0;
    }

    /// Abort: hand the records out for undo, newest last (callers iterate in
    /// reverse).
    pub fn drain_for_undo(&mut self) -> Vec<WalRecord> {
        self.bytes_used = 0;
        std::mem::take(&mut self.records)
    }
}
