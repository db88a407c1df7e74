//! Version-chain reconstruction.
//!
//! Walks a chain from the primary toward older versions, applying delta
//! payloads to a scratch buffer (or swapping in full prior images) until a
//! version visible to the observer's snapshot is materialized. A chain
//! truncated by garbage collection reads as invisible: the collector only
//! removes versions every possible snapshot is past.

use tracing::trace;

use crate::btree::ChainIterator;
use crate::config::Config;
use crate::txn::Worker;
use crate::types::Result;

use super::fat;
use super::tuple::{self, TupleFormat, TupleHeader, UpdateDescriptor};

/// Reconstructs the value of the tuple under the iterator's current slot
/// (the primary at `key` with a zero SN suffix) for the worker's snapshot.
/// `key` is the composed key buffer and is rewritten in place while seeking
/// secondaries.
pub(crate) fn reconstruct<I: ChainIterator>(
    worker: &Worker,
    config: &Config,
    iter: &mut I,
    key: &mut [u8],
) -> Result<Option<Vec<u8>>> {
    debug_assert_eq!(tuple::key_sn(key), 0);
    let head = iter.value();
    let header = TupleHeader::parse(head)?;
    if header.format == TupleFormat::Fat {
        return fat::reconstruct_fat(worker, head);
    }
    if worker.is_visible_for_me(header.worker_id, header.commit_mark) {
        if header.is_removed {
            return Ok(None);
        }
        return Ok(Some(tuple::primary_payload(head).to_vec()));
    }
    if tuple::next_sn(head) == 0 {
        // No older version reachable: the head is final.
        return Ok(None);
    }

    let mut value = tuple::primary_payload(head).to_vec();
    let mut sn = tuple::next_sn(head);
    let mut walked = 1usize;
    while sn != 0 {
        let higher = sn >= tuple::key_sn(key);
        tuple::set_key_sn(key, sn);
        if !iter.seek_exact_with_hint(key, higher) {
            // Chain truncated by GC.
            trace!(walked, "chain truncated during reconstruction");
            return Ok(None);
        }
        walked += 1;
        assert!(
            walked <= config.max_chain_length,
            "version chain exceeded {} entries: garbage collection is falling behind or the chain is cyclic",
            config.max_chain_length
        );
        let version = iter.value();
        let vh = TupleHeader::parse(version)?;
        let payload = tuple::version_payload(version);
        if vh.is_delta {
            let (descriptor, consumed) = UpdateDescriptor::decode(payload)?;
            descriptor.validate_against(value.len())?;
            tuple::apply_diff(&descriptor, &mut value, &payload[consumed..]);
        } else {
            value = payload.to_vec();
        }
        if worker.is_visible_for_me(vh.worker_id, vh.commit_mark) {
            if vh.is_removed {
                return Ok(None);
            }
            trace!(walked, "reconstructed from chain");
            return Ok(Some(value));
        }
        sn = tuple::next_sn(version);
    }
    Ok(None)
}
