// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Open-addressing bucket index with linear probing.
//!
//! One bucket is a single u64 word: the low 32 bits hold the slot
//! reference, the high 32 bits the stored key hash. Packing both into one
//! word means every bucket mutation is a single aligned atomic store, so a
//! reader can never observe a slot reference paired with a stale hash.
//!
//! Probing starts at `hash mod bucket_count` and walks forward with
//! wraparound. Tombstones keep probe chains intact: lookup skips them,
//! insert reuses the first one on its path, delete writes one but never
//! writes EMPTY. A probe that visits every bucket without finding EMPTY is
//! corruption — the creation-time load factor guarantees EMPTY buckets.

use std::sync::atomic::Ordering;

use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::layout::{META_RESERVED_MASK, META_USED};

/// Slot-reference sentinel: bucket never held an entry (terminates probing).
pub(crate) const EMPTY: u32 = 0xFFFF_FFFF;

/// Slot-reference sentinel: bucket held an entry that was deleted.
pub(crate) const TOMBSTONE: u32 = 0xFFFF_FFFE;

/// Freshly formatted bucket word: EMPTY reference, zero hash.
pub(crate) const EMPTY_WORD: u64 = EMPTY as u64;

/// Pack a slot reference and stored hash into one bucket word.
#[inline]
pub(crate) const fn pack(slot_ref: u32, hash: u32) -> u64 {
    (hash as u64) << 32 | slot_ref as u64
}

/// Slot reference half of a bucket word.
#[inline]
pub(crate) const fn slot_ref(word: u64) -> u32 {
    word as u32
}

/// Stored hash half of a bucket word.
#[inline]
pub(crate) const fn stored_hash(word: u64) -> u32 {
    (word >> 32) as u32
}

/// A live bucket hit: the slot and the bucket referencing it.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Hit {
    pub slot_id: u32,
    pub bucket_idx: u64,
}

/// Probe for a live slot holding `key`.
///
/// Callers must either hold writer exclusivity or run inside the seqlock
/// read envelope: any `Corrupt` returned from here is re-checked against
/// the generation counter by the envelope before it reaches the caller.
pub(crate) fn lookup(cache: &Cache, key: &[u8], hash: u32) -> Result<Option<Hit>> {
    let geo = cache.geo();
    let mask = u64::from(geo.bucket_count) - 1;
    let highwater = cache.highwater_word().load(Ordering::Acquire);
    let mut idx = u64::from(hash) & mask;

    for _ in 0..geo.bucket_count {
        let word = cache.bucket_word(idx).load(Ordering::Acquire);
        let slot = slot_ref(word);
        if slot == EMPTY {
            return Ok(None);
        }
        if slot != TOMBSTONE && stored_hash(word) == hash {
            if u64::from(slot) >= highwater {
                return Err(Error::Corrupt(format!(
                    "bucket {} references slot {} past highwater {}",
                    idx, slot, highwater
                )));
            }
            let meta = cache.slot_meta(slot).load(Ordering::Acquire);
            if meta & META_RESERVED_MASK != 0 {
                return Err(Error::Corrupt(format!(
                    "slot {} has reserved meta bits set ({:#x})",
                    slot, meta
                )));
            }
            if meta & META_USED == 0 {
                return Err(Error::Corrupt(format!(
                    "bucket {} references unused slot {}",
                    idx, slot
                )));
            }
            if cache.slot_key(slot) == key {
                return Ok(Some(Hit { slot_id: slot, bucket_idx: idx }));
            }
        }
        idx = (idx + 1) & mask;
    }
    Err(Error::Corrupt("probe chain has no EMPTY bucket".into()))
}

/// Insert a bucket entry for a freshly allocated slot.
///
/// Requires writer exclusivity and a key known to be absent. Reuses the
/// first tombstone on the probe path, otherwise claims the terminating
/// EMPTY bucket. Returns the bucket index written.
pub(crate) fn insert(cache: &Cache, slot_id: u32, hash: u32) -> Result<u64> {
    let geo = cache.geo();
    let mask = u64::from(geo.bucket_count) - 1;
    let mut idx = u64::from(hash) & mask;
    let mut reuse: Option<u64> = None;

    for _ in 0..geo.bucket_count {
        let word = cache.bucket_word(idx).load(Ordering::Acquire);
        let slot = slot_ref(word);
        if slot == EMPTY {
            let target = reuse.unwrap_or(idx);
            cache.bucket_word(target).store(pack(slot_id, hash), Ordering::Release);
            return Ok(target);
        }
        if slot == TOMBSTONE && reuse.is_none() {
            reuse = Some(idx);
        }
        idx = (idx + 1) & mask;
    }
    Err(Error::Corrupt("probe chain has no EMPTY bucket".into()))
}

/// Replace a live bucket entry with a tombstone, keeping the stored hash so
/// the probe chain stays intact. Requires writer exclusivity.
pub(crate) fn mark_tombstone(cache: &Cache, bucket_idx: u64) {
    let word = cache.bucket_word(bucket_idx).load(Ordering::Acquire);
    cache
        .bucket_word(bucket_idx)
        .store(pack(TOMBSTONE, stored_hash(word)), Ordering::Release);
}
