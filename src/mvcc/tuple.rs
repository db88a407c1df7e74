//! On-page tuple formats.
//!
//! Every physical value in the tree starts with a one-byte format tag so a
//! slot can never be mis-decoded: CHAINED for primary tuples and secondary
//! versions (told apart by the SN suffix of their key, not by the tag), FAT
//! for the packed delta-list container. All fields are packed; payloads are
//! not aligned.
//!
//! Physical keys are `user_key || sn` with a big-endian fixed-width SN so
//! that all versions of a logical key cluster behind its primary.

use smallvec::SmallVec;

use crate::types::{CadenaError, ChainSn, CommitMark, Result, Sat, WorkerId};

/// Format tag of chained tuples (primaries and secondary versions).
pub const FORMAT_CHAINED: u8 = 1;
/// Format tag of fat tuples.
pub const FORMAT_FAT: u8 = 2;

/// Width of the SN suffix appended to user keys.
pub const SN_LEN: usize = 8;

const FORMAT_OFFSET: usize = 0;
const FLAGS_OFFSET: usize = 1;
const WORKER_OFFSET: usize = 2;
const COMMIT_MARK_OFFSET: usize = 3;
const READ_LOCK_OFFSET: usize = 11;
const READ_TS_OFFSET: usize = 19;

/// Length of the header shared by every tuple format.
pub const TUPLE_HEADER_LEN: usize = 27;

const NEXT_SN_OFFSET: usize = TUPLE_HEADER_LEN;

/// Fixed prefix of a primary tuple: common header + `next_sn`.
pub const PRIMARY_HEADER_LEN: usize = TUPLE_HEADER_LEN + 8;

const SAT_OFFSET: usize = PRIMARY_HEADER_LEN;
const GC_TRIGGER_OFFSET: usize = SAT_OFFSET + 8;

/// Fixed prefix of a secondary version: primary prefix + SAT watermark +
/// GC trigger.
pub const VERSION_HEADER_LEN: usize = GC_TRIGGER_OFFSET + 8;

/// Header flag bits.
pub mod flags {
    /// One-bit spinlock held during in-place mutation of the tuple.
    pub const WRITE_LOCK: u8 = 0x01;
    /// The tuple is a tombstone (primaries) or carries a removed image.
    pub const REMOVED: u8 = 0x02;
    /// Secondary payload is a `(descriptor, diff)` pair rather than a full
    /// prior image.
    pub const DELTA: u8 = 0x04;
    /// Hint that this chain is a candidate for fat-tuple conversion.
    pub const CONVERTIBLE: u8 = 0x08;
}

/// Tuple format dispatch.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TupleFormat {
    Chained,
    Fat,
}

/// Reads the format tag. The tag is the first payload byte by construction.
pub fn format(buf: &[u8]) -> Result<TupleFormat> {
    match buf.first() {
        Some(&FORMAT_CHAINED) => Ok(TupleFormat::Chained),
        Some(&FORMAT_FAT) => Ok(TupleFormat::Fat),
        _ => Err(CadenaError::Corruption("unknown tuple format")),
    }
}

/// Decoded common header. Mutation happens in place through the accessor
/// functions below; this struct is a read-only snapshot.
#[derive(Copy, Clone, Debug)]
pub struct TupleHeader {
    pub format: TupleFormat,
    pub worker_id: WorkerId,
    pub commit_mark: CommitMark,
    pub write_locked: bool,
    pub is_removed: bool,
    pub is_delta: bool,
    pub convertible: bool,
    pub read_lock_bitmap: u64,
    pub read_ts: u64,
}

impl TupleHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < TUPLE_HEADER_LEN {
            return Err(CadenaError::Corruption("tuple shorter than header"));
        }
        let format = format(buf)?;
        let fl = buf[FLAGS_OFFSET];
        Ok(Self {
            format,
            worker_id: WorkerId(buf[WORKER_OFFSET]),
            commit_mark: read_u64(buf, COMMIT_MARK_OFFSET),
            write_locked: fl & flags::WRITE_LOCK != 0,
            is_removed: fl & flags::REMOVED != 0,
            is_delta: fl & flags::DELTA != 0,
            convertible: fl & flags::CONVERTIBLE != 0,
            read_lock_bitmap: read_u64(buf, READ_LOCK_OFFSET),
            read_ts: read_u64(buf, READ_TS_OFFSET),
        })
    }
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_be_bytes(buf[offset..offset + 8].try_into().expect("bounds checked"))
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

/// The `(worker_id, commit_mark)` stamp of the tuple.
pub fn stamp(buf: &[u8]) -> (WorkerId, CommitMark) {
    (WorkerId(buf[WORKER_OFFSET]), read_u64(buf, COMMIT_MARK_OFFSET))
}

/// Restamps the tuple with a new `(worker_id, commit_mark)`.
pub fn set_stamp(buf: &mut [u8], worker_id: WorkerId, commit_mark: CommitMark) {
    buf[WORKER_OFFSET] = worker_id.0;
    write_u64(buf, COMMIT_MARK_OFFSET, commit_mark);
}

pub fn is_write_locked(buf: &[u8]) -> bool {
    buf[FLAGS_OFFSET] & flags::WRITE_LOCK != 0
}

/// Sets the write-lock bit. Callers hold the leaf exclusively, so this is a
/// plain bit flip, not an atomic.
pub fn write_lock(buf: &mut [u8]) {
    debug_assert!(!is_write_locked(buf), "tuple already write-locked");
    buf[FLAGS_OFFSET] |= flags::WRITE_LOCK;
}

pub fn write_unlock(buf: &mut [u8]) {
    buf[FLAGS_OFFSET] &= !flags::WRITE_LOCK;
}

pub fn is_removed(buf: &[u8]) -> bool {
    buf[FLAGS_OFFSET] & flags::REMOVED != 0
}

pub fn set_removed(buf: &mut [u8], removed: bool) {
    if removed {
        buf[FLAGS_OFFSET] |= flags::REMOVED;
    } else {
        buf[FLAGS_OFFSET] &= !flags::REMOVED;
    }
}

pub fn is_delta(buf: &[u8]) -> bool {
    buf[FLAGS_OFFSET] & flags::DELTA != 0
}

pub fn is_convertible(buf: &[u8]) -> bool {
    buf[FLAGS_OFFSET] & flags::CONVERTIBLE != 0
}

pub fn set_convertible(buf: &mut [u8], convertible: bool) {
    if convertible {
        buf[FLAGS_OFFSET] |= flags::CONVERTIBLE;
    } else {
        buf[FLAGS_OFFSET] &= !flags::CONVERTIBLE;
    }
}

pub fn read_lock_bitmap(buf: &[u8]) -> u64 {
    read_u64(buf, READ_LOCK_OFFSET)
}

pub fn set_read_lock_bitmap(buf: &mut [u8], bitmap: u64) {
    write_u64(buf, READ_LOCK_OFFSET, bitmap);
}

pub fn read_ts(buf: &[u8]) -> u64 {
    read_u64(buf, READ_TS_OFFSET)
}

pub fn set_read_ts(buf: &mut [u8], ts: u64) {
    write_u64(buf, READ_TS_OFFSET, ts);
}

/// SN of the next (older) version in the chain; zero terminates. Valid for
/// both primaries and secondary versions.
pub fn next_sn(buf: &[u8]) -> ChainSn {
    read_u64(buf, NEXT_SN_OFFSET)
}

pub fn set_next_sn(buf: &mut [u8], sn: ChainSn) {
    write_u64(buf, NEXT_SN_OFFSET, sn);
}

/// Encodes a fresh primary tuple with no secondaries.
pub fn encode_primary(worker_id: WorkerId, commit_mark: CommitMark, value: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; PRIMARY_HEADER_LEN + value.len()];
    buf[FORMAT_OFFSET] = FORMAT_CHAINED;
    set_stamp(&mut buf, worker_id, commit_mark);
    set_convertible(&mut buf, true);
    buf[PRIMARY_HEADER_LEN..].copy_from_slice(value);
    buf
}

/// Payload of a primary tuple.
pub fn primary_payload(buf: &[u8]) -> &[u8] {
    &buf[PRIMARY_HEADER_LEN..]
}

pub fn primary_payload_mut(buf: &mut [u8]) -> &mut [u8] {
    &mut buf[PRIMARY_HEADER_LEN..]
}

/// Returns the primary to a canonical unlocked state after GC retired its
/// only secondary: read metadata and the conversion hint are cleared, the
/// stamp and payload stay.
pub fn primary_reset(buf: &mut [u8]) {
    buf[FLAGS_OFFSET] = flags::CONVERTIBLE;
    set_read_lock_bitmap(buf, 0);
    set_read_ts(buf, 0);
}

/// Encodes a secondary version. A delta version carries a
/// `(descriptor, diff)` payload; a full version carries the prior image.
pub fn encode_version(
    worker_id: WorkerId,
    commit_mark: CommitMark,
    delta: bool,
    next: ChainSn,
    committed_before_sat: Sat,
    gc_trigger: u64,
    payload: &[u8],
) -> Vec<u8> {
    let mut buf = vec![0u8; VERSION_HEADER_LEN + payload.len()];
    buf[FORMAT_OFFSET] = FORMAT_CHAINED;
    set_stamp(&mut buf, worker_id, commit_mark);
    if delta {
        buf[FLAGS_OFFSET] |= flags::DELTA;
    }
    set_next_sn(&mut buf, next);
    write_u64(&mut buf, SAT_OFFSET, committed_before_sat);
    write_u64(&mut buf, GC_TRIGGER_OFFSET, gc_trigger);
    buf[VERSION_HEADER_LEN..].copy_from_slice(payload);
    buf
}

/// SAT watermark under which this version was superseded; `u64::MAX` when the
/// superseding transaction rewrote its own version.
pub fn committed_before_sat(buf: &[u8]) -> Sat {
    read_u64(buf, SAT_OFFSET)
}

/// The LWM value at which this version becomes prunable.
pub fn gc_trigger(buf: &[u8]) -> u64 {
    read_u64(buf, GC_TRIGGER_OFFSET)
}

/// Payload of a secondary version.
pub fn version_payload(buf: &[u8]) -> &[u8] {
    &buf[VERSION_HEADER_LEN..]
}

/// Composes the physical key `user_key || sn`.
pub fn compose_key(user_key: &[u8], sn: ChainSn) -> SmallVec<[u8; 40]> {
    let mut key = SmallVec::with_capacity(user_key.len() + SN_LEN);
    key.extend_from_slice(user_key);
    key.extend_from_slice(&sn.to_be_bytes());
    key
}

/// Rewrites the SN suffix of a composed key in place.
pub fn set_key_sn(key: &mut [u8], sn: ChainSn) {
    let at = key.len() - SN_LEN;
    key[at..].copy_from_slice(&sn.to_be_bytes());
}

/// SN suffix of a composed key.
pub fn key_sn(key: &[u8]) -> ChainSn {
    let at = key.len() - SN_LEN;
    u64::from_be_bytes(key[at..].try_into().expect("sn suffix present"))
}

/// User-key prefix of a composed key.
pub fn user_key(key: &[u8]) -> &[u8] {
    &key[..key.len() - SN_LEN]
}

/// One touched attribute slice of an update.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct DescriptorSlot {
    pub offset: u16,
    pub len: u16,
}

/// Ordered list of `(offset, length)` attribute slices an update touches.
///
/// A *diff* is the concatenation of the payload bytes under those slices; an
/// *XOR-diff* is `old XOR new` over them, which makes undo a re-application.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct UpdateDescriptor {
    pub slots: SmallVec<[DescriptorSlot; 4]>,
}

impl UpdateDescriptor {
    /// Descriptor covering a single slice.
    pub fn slice(offset: u16, len: u16) -> Self {
        let mut slots = SmallVec::new();
        slots.push(DescriptorSlot { offset, len });
        Self { slots }
    }

    /// Descriptor covering the whole value.
    pub fn whole(len: u16) -> Self {
        Self::slice(0, len)
    }

    /// Total diff bytes the descriptor produces.
    pub fn diff_len(&self) -> usize {
        self.slots.iter().map(|s| s.len as usize).sum()
    }

    /// Encoded size: slot count plus packed slots.
    pub fn encoded_len(&self) -> usize {
        2 + self.slots.len() * 4
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let count = u16::try_from(self.slots.len()).expect("descriptor slot count fits u16");
        out.extend_from_slice(&count.to_be_bytes());
        for slot in &self.slots {
            out.extend_from_slice(&slot.offset.to_be_bytes());
            out.extend_from_slice(&slot.len.to_be_bytes());
        }
    }

    /// Decodes a descriptor from the front of `src`, returning it together
    /// with the number of bytes consumed.
    pub fn decode(src: &[u8]) -> Result<(Self, usize)> {
        if src.len() < 2 {
            return Err(CadenaError::Corruption("update descriptor truncated"));
        }
        let count = u16::from_be_bytes(src[0..2].try_into().expect("len checked")) as usize;
        let end = 2 + count * 4;
        if src.len() < end {
            return Err(CadenaError::Corruption("update descriptor slots truncated"));
        }
        let mut slots = SmallVec::with_capacity(count);
        for i in 0..count {
            let at = 2 + i * 4;
            slots.push(DescriptorSlot {
                offset: u16::from_be_bytes(src[at..at + 2].try_into().expect("len checked")),
                len: u16::from_be_bytes(src[at + 2..at + 4].try_into().expect("len checked")),
            });
        }
        Ok((Self { slots }, end))
    }

    /// Rejects descriptors whose slices fall outside a payload of
    /// `payload_len` bytes.
    pub fn validate_against(&self, payload_len: usize) -> Result<()> {
        for slot in &self.slots {
            let end = slot.offset as usize + slot.len as usize;
            if end > payload_len {
                return Err(CadenaError::Invalid("descriptor slice out of payload bounds"));
            }
        }
        Ok(())
    }
}

/// Appends the payload bytes under the descriptor's slices to `out`.
pub fn generate_diff(desc: &UpdateDescriptor, out: &mut Vec<u8>, payload: &[u8]) {
    for slot in &desc.slots {
        let at = slot.offset as usize;
        out.extend_from_slice(&payload[at..at + slot.len as usize]);
    }
}

/// XORs the payload's slices into `diff`, turning an old-image diff into an
/// `old XOR new` diff once the payload holds the new image.
pub fn generate_xor_diff(desc: &UpdateDescriptor, diff: &mut [u8], payload: &[u8]) {
    let mut pos = 0;
    for slot in &desc.slots {
        let at = slot.offset as usize;
        for (d, p) in diff[pos..pos + slot.len as usize]
            .iter_mut()
            .zip(&payload[at..at + slot.len as usize])
        {
            *d ^= *p;
        }
        pos += slot.len as usize;
    }
}

/// Copies the diff back over the payload's slices (restores a prior image).
pub fn apply_diff(desc: &UpdateDescriptor, payload: &mut [u8], diff: &[u8]) {
    let mut pos = 0;
    for slot in &desc.slots {
        let at = slot.offset as usize;
        payload[at..at + slot.len as usize].copy_from_slice(&diff[pos..pos + slot.len as usize]);
        pos += slot.len as usize;
    }
}

/// XORs the diff into the payload's slices. Applying the same XOR-diff twice
/// is the identity.
pub fn apply_xor_diff(desc: &UpdateDescriptor, payload: &mut [u8], diff: &[u8]) {
    let mut pos = 0;
    for slot in &desc.slots {
        let at = slot.offset as usize;
        for (p, d) in payload[at..at + slot.len as usize]
            .iter_mut()
            .zip(&diff[pos..pos + slot.len as usize])
        {
            *p ^= *d;
        }
        pos += slot.len as usize;
    }
}
