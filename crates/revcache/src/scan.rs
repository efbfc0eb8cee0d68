// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Table scans: whole-table, byte-prefix, bit-prefix, and sorted range.
//!
//! Every scan runs inside the seqlock envelope, so a retry rebuilds the
//! result set from scratch and a caller never sees entries from two
//! different commits in one result. Filter callbacks receive key and index
//! slices borrowed straight from the mapping; they are valid only for the
//! duration of the call and may be re-invoked when the envelope retries.
//!
//! In ordered-keys mode, range scans (and prefix scans starting at offset
//! 0) binary-search the sorted slot array instead of walking every slot.
//! Tombstones keep their key bytes, so they participate in the ordering and
//! the search stays correct after deletes.

use std::sync::atomic::Ordering;

use crate::cache::{Cache, Entry};
use crate::error::{Error, Result};
use crate::layout::{META_RESERVED_MASK, META_USED};
use crate::seqlock;

/// Upper bound on scan `offset` and `limit`.
pub const MAX_SCAN_BOUND: usize = 100_000_000;

/// Options shared by all scan variants.
///
/// `limit == 0` means unlimited. `offset` skips matching entries (after the
/// filter) in iteration order; `reverse` iterates slots backward.
#[derive(Default)]
pub struct ScanOpts<'f> {
    /// Predicate over `(key, revision, index)`; a `false` return drops the
    /// entry. The slices are mmap-backed and only valid during the call.
    pub filter: Option<&'f mut dyn FnMut(&[u8], i64, &[u8]) -> bool>,
    pub reverse: bool,
    pub offset: usize,
    pub limit: usize,
}

impl std::fmt::Debug for ScanOpts<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanOpts")
            .field("filter", &self.filter.is_some())
            .field("reverse", &self.reverse)
            .field("offset", &self.offset)
            .field("limit", &self.limit)
            .finish()
    }
}

/// Bit-granular prefix for [`Cache::scan_match`].
///
/// `offset` is the byte position in the key where matching starts. With
/// `bits == 0`, all of `bytes` is compared; otherwise exactly `bits` bits
/// are compared MSB-first and `bytes` must be `ceil(bits / 8)` long.
#[derive(Debug, Clone, Copy)]
pub struct PrefixSpec<'a> {
    pub offset: usize,
    pub bits: usize,
    pub bytes: &'a [u8],
}

/// A validated, precomputed matcher for one scan.
struct Matcher<'a> {
    offset: usize,
    full: usize,
    tail_mask: u8,
    bytes: &'a [u8],
}

impl<'a> PrefixSpec<'a> {
    fn compile(&self, key_size: u32) -> Result<Matcher<'a>> {
        let key_size = key_size as usize;
        if self.bits == 0 {
            if self.offset + self.bytes.len() > key_size {
                return Err(Error::InvalidInput(format!(
                    "prefix spec spans bytes {}..{} beyond key_size {}",
                    self.offset,
                    self.offset + self.bytes.len(),
                    key_size
                )));
            }
            return Ok(Matcher {
                offset: self.offset,
                full: self.bytes.len(),
                tail_mask: 0,
                bytes: self.bytes,
            });
        }
        let need = self.bits.div_ceil(8);
        if self.bytes.len() != need {
            return Err(Error::InvalidInput(format!(
                "prefix spec has {} bytes for {} bits (need {})",
                self.bytes.len(),
                self.bits,
                need
            )));
        }
        if self.offset + need > key_size {
            return Err(Error::InvalidInput(format!(
                "prefix spec spans bytes {}..{} beyond key_size {}",
                self.offset,
                self.offset + need,
                key_size
            )));
        }
        let rem = self.bits % 8;
        Ok(Matcher {
            offset: self.offset,
            full: self.bits / 8,
            tail_mask: if rem == 0 { 0 } else { 0xFFu8 << (8 - rem) },
            bytes: self.bytes,
        })
    }
}

impl Matcher<'_> {
    #[inline]
    fn matches(&self, key: &[u8]) -> bool {
        let base = self.offset;
        if key[base..base + self.full] != self.bytes[..self.full] {
            return false;
        }
        if self.tail_mask != 0 {
            return (key[base + self.full] ^ self.bytes[self.full]) & self.tail_mask == 0;
        }
        true
    }
}

fn check_opts(opts: &ScanOpts<'_>) -> Result<()> {
    if opts.offset > MAX_SCAN_BOUND {
        return Err(Error::InvalidInput(format!(
            "scan offset {} exceeds {}",
            opts.offset, MAX_SCAN_BOUND
        )));
    }
    if opts.limit > MAX_SCAN_BOUND {
        return Err(Error::InvalidInput(format!(
            "scan limit {} exceeds {}",
            opts.limit, MAX_SCAN_BOUND
        )));
    }
    Ok(())
}

/// Right-pad a bound or prefix with 0x00 to the full key size.
fn pad_key(b: &[u8], key_size: usize) -> Vec<u8> {
    let mut v = b.to_vec();
    v.resize(key_size, 0);
    v
}

/// Lexicographically smallest key greater than every key with `prefix`,
/// or `None` when the prefix is all 0xFF (scan to the end instead).
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut s = prefix.to_vec();
    for i in (0..s.len()).rev() {
        if s[i] != 0xFF {
            s[i] += 1;
            s.truncate(i + 1);
            return Some(s);
        }
    }
    None
}

impl Cache {
    /// Scan every live entry in slot order.
    pub fn scan(&self, mut opts: ScanOpts<'_>) -> Result<Vec<Entry>> {
        check_opts(&opts)?;
        self.linear_scan(|_| true, &mut opts)
    }

    /// Scan live entries whose key starts with `prefix`.
    ///
    /// In ordered-keys mode with `opts.offset == 0` this narrows to the key
    /// range `[prefix, successor(prefix))` via binary search.
    pub fn scan_prefix(&self, prefix: &[u8], mut opts: ScanOpts<'_>) -> Result<Vec<Entry>> {
        check_opts(&opts)?;
        let key_size = self.geo().key_size as usize;
        if prefix.len() > key_size {
            return Err(Error::InvalidInput(format!(
                "prefix length {} exceeds key_size {}",
                prefix.len(),
                key_size
            )));
        }
        if self.ordered_keys() && opts.offset == 0 {
            let start = pad_key(prefix, key_size);
            let end = prefix_successor(prefix).map(|s| pad_key(&s, key_size));
            return self.ordered_walk(Some(start), end, &mut opts);
        }
        let prefix = prefix.to_vec();
        self.linear_scan(|key| key.starts_with(&prefix), &mut opts)
    }

    /// Scan live entries matching a bit-granular prefix spec.
    pub fn scan_match(&self, spec: &PrefixSpec<'_>, mut opts: ScanOpts<'_>) -> Result<Vec<Entry>> {
        check_opts(&opts)?;
        let matcher = spec.compile(self.geo().key_size)?;
        self.linear_scan(|key| matcher.matches(key), &mut opts)
    }

    /// Scan live entries with `start <= key < end` (ordered-keys mode only).
    ///
    /// Bounds shorter than `key_size` are right-padded with 0x00; a missing
    /// `start` scans from the beginning, a missing `end` to the end.
    pub fn scan_range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        mut opts: ScanOpts<'_>,
    ) -> Result<Vec<Entry>> {
        check_opts(&opts)?;
        if !self.ordered_keys() {
            return Err(Error::Unordered);
        }
        let key_size = self.geo().key_size as usize;
        for bound in [start, end].into_iter().flatten() {
            if bound.len() > key_size {
                return Err(Error::InvalidInput(format!(
                    "range bound length {} exceeds key_size {}",
                    bound.len(),
                    key_size
                )));
            }
        }
        let start = start.map(|b| pad_key(b, key_size));
        let end = end.map(|b| pad_key(b, key_size));
        if let (Some(s), Some(e)) = (&start, &end) {
            if s > e {
                return Err(Error::InvalidInput("range start exceeds range end".into()));
            }
        }
        self.ordered_walk(start, end, &mut opts)
    }

    /// Walk every slot, applying `pred` to live keys.
    fn linear_scan(
        &self,
        pred: impl Fn(&[u8]) -> bool,
        opts: &mut ScanOpts<'_>,
    ) -> Result<Vec<Entry>> {
        let _latch = self.entry.latch.read();
        self.ensure_open()?;
        seqlock::read_envelope(self.generation(), || {
            self.check_state()?;
            let highwater = self.checked_highwater()?;
            let ids: Box<dyn Iterator<Item = u64>> = if opts.reverse {
                Box::new((0..highwater).rev())
            } else {
                Box::new(0..highwater)
            };

            let mut out = Vec::new();
            let mut skipped = 0usize;
            for id in ids {
                let id = id as u32;
                let meta = self.slot_meta(id).load(Ordering::Acquire);
                if meta & META_RESERVED_MASK != 0 {
                    return Err(Error::Corrupt(format!(
                        "slot {} has reserved meta bits set ({:#x})",
                        id, meta
                    )));
                }
                if meta & META_USED == 0 {
                    continue;
                }
                let key = self.slot_key(id);
                if !pred(key) {
                    continue;
                }
                let revision = self.slot_revision(id).load(Ordering::Acquire) as i64;
                let index = self.slot_index(id);
                if let Some(filter) = opts.filter.as_mut() {
                    if !filter(key, revision, index) {
                        continue;
                    }
                }
                if skipped < opts.offset {
                    skipped += 1;
                    continue;
                }
                out.push(Entry { key: key.to_vec(), revision, index: index.to_vec() });
                if opts.limit > 0 && out.len() == opts.limit {
                    break;
                }
            }
            Ok(out)
        })
    }

    /// Walk the sorted slot range `[start, end)` located by binary search.
    ///
    /// Visits tombstones for validation (they carry keys and participate in
    /// the ordering); a bounds or adjacency violation among the visited keys
    /// means the sorted invariant does not hold.
    fn ordered_walk(
        &self,
        start: Option<Vec<u8>>,
        end: Option<Vec<u8>>,
        opts: &mut ScanOpts<'_>,
    ) -> Result<Vec<Entry>> {
        let _latch = self.entry.latch.read();
        self.ensure_open()?;
        seqlock::read_envelope(self.generation(), || {
            self.check_state()?;
            let highwater = self.checked_highwater()?;
            let lo = match &start {
                Some(s) => self.lower_bound(highwater, s),
                None => 0,
            };
            let hi = match &end {
                Some(e) => self.lower_bound(highwater, e),
                None => highwater,
            };
            let ids: Box<dyn Iterator<Item = u64>> = if opts.reverse {
                Box::new((lo..hi).rev())
            } else {
                Box::new(lo..hi)
            };

            let mut out = Vec::new();
            let mut skipped = 0usize;
            let mut prev: Option<&[u8]> = None;
            for id in ids {
                let id = id as u32;
                let meta = self.slot_meta(id).load(Ordering::Acquire);
                if meta & META_RESERVED_MASK != 0 {
                    return Err(Error::Corrupt(format!(
                        "slot {} has reserved meta bits set ({:#x})",
                        id, meta
                    )));
                }
                let key = self.slot_key(id);
                // The binary search is only meaningful over a sorted array:
                // a key outside the requested bounds, or a step against the
                // iteration direction, disproves the invariant.
                if let Some(s) = &start {
                    if key < &s[..] {
                        return Err(Error::Corrupt("sorted invariant violated".into()));
                    }
                }
                if let Some(e) = &end {
                    if key >= &e[..] {
                        return Err(Error::Corrupt("sorted invariant violated".into()));
                    }
                }
                if let Some(prev) = prev {
                    let descending = if opts.reverse { prev < key } else { prev > key };
                    if descending {
                        return Err(Error::Corrupt("sorted invariant violated".into()));
                    }
                }
                prev = Some(key);

                if meta & META_USED == 0 {
                    continue;
                }
                let revision = self.slot_revision(id).load(Ordering::Acquire) as i64;
                let index = self.slot_index(id);
                if let Some(filter) = opts.filter.as_mut() {
                    if !filter(key, revision, index) {
                        continue;
                    }
                }
                if skipped < opts.offset {
                    skipped += 1;
                    continue;
                }
                out.push(Entry { key: key.to_vec(), revision, index: index.to_vec() });
                if opts.limit > 0 && out.len() == opts.limit {
                    break;
                }
            }
            Ok(out)
        })
    }

    /// Highwater with its own impossibility check so a torn value cannot
    /// drive the walk out of bounds.
    fn checked_highwater(&self) -> Result<u64> {
        let highwater = self.highwater_word().load(Ordering::Acquire);
        if highwater > u64::from(self.geo().slot_capacity) {
            return Err(Error::Corrupt(format!(
                "slot_highwater {} exceeds slot_capacity {}",
                highwater,
                self.geo().slot_capacity
            )));
        }
        Ok(highwater)
    }

    /// First slot in `[0, highwater)` whose key is `>= bound`.
    fn lower_bound(&self, highwater: u64, bound: &[u8]) -> u64 {
        let mut lo = 0u64;
        let mut hi = highwater;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.slot_key(mid as u32) < bound {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }
}
