// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! On-disk layout: header format and derived geometry.
//!
//! The file is a fixed prefix header, a bucket region, and a slot region:
//!
//! ```text
//! +--------------------------------------------------------------+
//! | Header (256 bytes, little-endian, CRC-32C protected)         |
//! +--------------------------------------------------------------+
//! | Bucket[0..bucket_count]   (8 bytes each: slot_ref | hash)    |
//! +--------------------------------------------------------------+
//! | Slot[0..slot_capacity]    (slot_size bytes each)             |
//! |   u64 meta | key | pad8 | i64 revision | index | pad8        |
//! +--------------------------------------------------------------+
//! ```
//!
//! Every integer field is little-endian. All 64-bit words that concurrent
//! readers may observe while a writer is active (generation, state,
//! highwater, live count, slot meta, slot revision) sit at 8-byte-aligned
//! offsets so they can be accessed as aligned atomics.

use crate::error::{Error, Result};
use crate::options::Options;

/// Magic number at offset 0: "REVCACHE" as a little-endian u64.
pub const MAGIC: u64 = 0x4548_4341_4356_4552;

/// Current file format version.
pub const FORMAT_VERSION: u32 = 1;

/// Total header size; the bucket region starts right after it.
pub const HEADER_SIZE: usize = 256;

/// Size of the caller-owned data area inside the header.
pub const USER_DATA_SIZE: usize = 128;

/// Header flag bit: the sorted-keys invariant is enforced.
pub const FLAG_ORDERED_KEYS: u32 = 1;

/// Slot meta bit 0: the slot holds a live entry.
pub const META_USED: u64 = 1;

/// Slot meta bits that must read zero; any set bit observed with a stable
/// generation is corruption.
pub const META_RESERVED_MASK: u64 = !META_USED;

/// `state` header word values.
pub const STATE_ACTIVE: u64 = 0;
pub const STATE_INVALIDATED: u64 = 1;

// Header field offsets. The CRC covers everything before it.
pub const OFF_MAGIC: usize = 0;
pub const OFF_VERSION: usize = 8;
pub const OFF_FLAGS: usize = 12;
pub const OFF_KEY_SIZE: usize = 16;
pub const OFF_INDEX_SIZE: usize = 20;
pub const OFF_SLOT_CAPACITY: usize = 24;
pub const OFF_BUCKET_COUNT: usize = 28;
pub const OFF_SLOT_SIZE: usize = 32;
pub const OFF_USER_VERSION: usize = 36;
pub const OFF_SLOTS_OFFSET: usize = 40;
pub const OFF_SLOT_HIGHWATER: usize = 48;
pub const OFF_LIVE_COUNT: usize = 56;
pub const OFF_GENERATION: usize = 64;
pub const OFF_STATE: usize = 72;
pub const OFF_USER_FLAGS: usize = 80;
pub const OFF_USER_DATA: usize = 88;
pub const OFF_RESERVED: usize = OFF_USER_DATA + USER_DATA_SIZE; // 216
pub const OFF_HEADER_CRC: usize = HEADER_SIZE - 4; // 252

/// Round up to the next multiple of 8.
#[inline]
pub const fn align8(n: u64) -> u64 {
    (n + 7) & !7
}

/// CRC-32C over every header byte before the CRC word itself.
#[inline]
pub fn header_crc(header: &[u8]) -> u32 {
    debug_assert!(header.len() >= HEADER_SIZE);
    crc32c::crc32c(&header[..OFF_HEADER_CRC])
}

/// Fixed geometry derived from the configuration. Immutable once the file
/// exists; reopen recomputes it from the requested options and cross-checks
/// the recorded values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub key_size: u32,
    pub index_size: u32,
    pub slot_capacity: u32,
    pub bucket_count: u32,
    /// Byte offset of the revision word inside a slot.
    pub rev_offset: u32,
    /// Byte offset of the index payload inside a slot.
    pub index_offset: u32,
    pub slot_size: u32,
    pub slots_offset: u64,
    pub file_len: u64,
    pub ordered_keys: bool,
}

impl Geometry {
    /// Derive the full layout from validated options.
    pub fn from_options(opts: &Options) -> Self {
        // Load factor <= 0.5: power of two, at least twice the capacity.
        let bucket_count = u64::from(opts.slot_capacity)
            .saturating_mul(2)
            .next_power_of_two()
            .max(8) as u32;

        let rev_offset = align8(8 + u64::from(opts.key_size)) as u32;
        let index_offset = rev_offset + 8;
        let slot_size = align8(u64::from(index_offset) + u64::from(opts.index_size)) as u32;

        let buckets_size = u64::from(bucket_count) * 8;
        let slots_offset = align8(HEADER_SIZE as u64 + buckets_size);
        let file_len = slots_offset + u64::from(opts.slot_capacity) * u64::from(slot_size);

        Self {
            key_size: opts.key_size,
            index_size: opts.index_size,
            slot_capacity: opts.slot_capacity,
            bucket_count,
            rev_offset,
            index_offset,
            slot_size,
            slots_offset,
            file_len,
            ordered_keys: opts.ordered_keys,
        }
    }

    /// Byte offset of bucket `i`.
    #[inline]
    pub fn bucket_offset(&self, i: u64) -> u64 {
        HEADER_SIZE as u64 + i * 8
    }

    /// Byte offset of slot `id`.
    #[inline]
    pub fn slot_offset(&self, id: u32) -> u64 {
        self.slots_offset + u64::from(id) * u64::from(self.slot_size)
    }
}

/// A decoded copy of the header taken under the seqlock envelope.
#[derive(Debug, Clone)]
pub struct HeaderSnapshot {
    pub magic: u64,
    pub version: u32,
    pub flags: u32,
    pub key_size: u32,
    pub index_size: u32,
    pub slot_capacity: u32,
    pub bucket_count: u32,
    pub slot_size: u32,
    pub user_version: u32,
    pub slots_offset: u64,
    pub slot_highwater: u64,
    pub live_count: u64,
    pub generation: u64,
    pub state: u64,
    pub user_flags: u64,
    pub user_data: [u8; USER_DATA_SIZE],
    pub reserved_zero: bool,
    pub crc: u32,
}

#[inline]
fn get_u32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(b[off..off + 4].try_into().unwrap())
}

#[inline]
fn get_u64(b: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(b[off..off + 8].try_into().unwrap())
}

impl HeaderSnapshot {
    /// Decode a raw header copy. Performs no validation.
    pub fn decode(b: &[u8]) -> Self {
        debug_assert!(b.len() >= HEADER_SIZE);
        let mut user_data = [0u8; USER_DATA_SIZE];
        user_data.copy_from_slice(&b[OFF_USER_DATA..OFF_USER_DATA + USER_DATA_SIZE]);
        Self {
            magic: get_u64(b, OFF_MAGIC),
            version: get_u32(b, OFF_VERSION),
            flags: get_u32(b, OFF_FLAGS),
            key_size: get_u32(b, OFF_KEY_SIZE),
            index_size: get_u32(b, OFF_INDEX_SIZE),
            slot_capacity: get_u32(b, OFF_SLOT_CAPACITY),
            bucket_count: get_u32(b, OFF_BUCKET_COUNT),
            slot_size: get_u32(b, OFF_SLOT_SIZE),
            user_version: get_u32(b, OFF_USER_VERSION),
            slots_offset: get_u64(b, OFF_SLOTS_OFFSET),
            slot_highwater: get_u64(b, OFF_SLOT_HIGHWATER),
            live_count: get_u64(b, OFF_LIVE_COUNT),
            generation: get_u64(b, OFF_GENERATION),
            state: get_u64(b, OFF_STATE),
            user_flags: get_u64(b, OFF_USER_FLAGS),
            user_data,
            reserved_zero: b[OFF_RESERVED..OFF_HEADER_CRC].iter().all(|&x| x == 0),
            crc: get_u32(b, OFF_HEADER_CRC),
        }
    }

    /// Check the stored CRC against a freshly computed one.
    pub fn crc_matches(&self, raw: &[u8]) -> bool {
        self.crc == header_crc(raw)
    }

    /// Validate a stable (even-generation) header against the requested
    /// options and their derived geometry.
    ///
    /// Classification: structural impossibilities are `Corrupt`; legitimate
    /// differences from the requested configuration are `Incompatible`.
    pub fn validate(&self, raw: &[u8], geo: &Geometry, opts: &Options) -> Result<()> {
        if self.magic != MAGIC {
            return Err(Error::Corrupt(format!("bad magic {:#018x}", self.magic)));
        }
        if self.version != FORMAT_VERSION {
            return Err(Error::Incompatible(format!(
                "format version {} (expected {})",
                self.version, FORMAT_VERSION
            )));
        }
        if !self.crc_matches(raw) {
            return Err(Error::Corrupt("header CRC mismatch".into()));
        }
        if !self.reserved_zero || self.flags & !FLAG_ORDERED_KEYS != 0 {
            return Err(Error::Corrupt("reserved header bits set".into()));
        }

        let ordered = self.flags & FLAG_ORDERED_KEYS != 0;
        if self.key_size != opts.key_size
            || self.index_size != opts.index_size
            || self.slot_capacity != opts.slot_capacity
            || ordered != opts.ordered_keys
            || self.user_version != opts.user_version
        {
            return Err(Error::Incompatible(format!(
                "recorded key_size={} index_size={} slot_capacity={} ordered={} user_version={}, \
                 requested key_size={} index_size={} slot_capacity={} ordered={} user_version={}",
                self.key_size,
                self.index_size,
                self.slot_capacity,
                ordered,
                self.user_version,
                opts.key_size,
                opts.index_size,
                opts.slot_capacity,
                opts.ordered_keys,
                opts.user_version,
            )));
        }

        // Options match, so the recorded geometry must equal the derived one.
        if self.bucket_count != geo.bucket_count
            || self.slot_size != geo.slot_size
            || self.slots_offset != geo.slots_offset
        {
            return Err(Error::Corrupt(format!(
                "recorded geometry bucket_count={} slot_size={} slots_offset={} does not match \
                 derived bucket_count={} slot_size={} slots_offset={}",
                self.bucket_count,
                self.slot_size,
                self.slots_offset,
                geo.bucket_count,
                geo.slot_size,
                geo.slots_offset,
            )));
        }
        if self.slot_highwater > u64::from(self.slot_capacity) {
            return Err(Error::Corrupt(format!(
                "slot_highwater {} exceeds slot_capacity {}",
                self.slot_highwater, self.slot_capacity
            )));
        }
        if self.live_count > self.slot_highwater {
            return Err(Error::Corrupt(format!(
                "live_count {} exceeds slot_highwater {}",
                self.live_count, self.slot_highwater
            )));
        }
        if self.state != STATE_ACTIVE && self.state != STATE_INVALIDATED {
            return Err(Error::Corrupt(format!("unknown state word {}", self.state)));
        }
        Ok(())
    }
}

/// Encode a full header image for file creation.
///
/// `generation` is the value baked into the image; the CRC is computed over
/// the image with `final_generation` patched in, so the creator can publish
/// an odd generation first and flip to `final_generation` once the region is
/// formatted.
pub fn encode_header(geo: &Geometry, opts: &Options, generation: u64, final_generation: u64) -> [u8; HEADER_SIZE] {
    let mut b = [0u8; HEADER_SIZE];
    let mut flags = 0u32;
    if opts.ordered_keys {
        flags |= FLAG_ORDERED_KEYS;
    }
    b[OFF_MAGIC..OFF_MAGIC + 8].copy_from_slice(&MAGIC.to_le_bytes());
    b[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    b[OFF_FLAGS..OFF_FLAGS + 4].copy_from_slice(&flags.to_le_bytes());
    b[OFF_KEY_SIZE..OFF_KEY_SIZE + 4].copy_from_slice(&geo.key_size.to_le_bytes());
    b[OFF_INDEX_SIZE..OFF_INDEX_SIZE + 4].copy_from_slice(&geo.index_size.to_le_bytes());
    b[OFF_SLOT_CAPACITY..OFF_SLOT_CAPACITY + 4].copy_from_slice(&geo.slot_capacity.to_le_bytes());
    b[OFF_BUCKET_COUNT..OFF_BUCKET_COUNT + 4].copy_from_slice(&geo.bucket_count.to_le_bytes());
    b[OFF_SLOT_SIZE..OFF_SLOT_SIZE + 4].copy_from_slice(&geo.slot_size.to_le_bytes());
    b[OFF_USER_VERSION..OFF_USER_VERSION + 4].copy_from_slice(&opts.user_version.to_le_bytes());
    b[OFF_SLOTS_OFFSET..OFF_SLOTS_OFFSET + 8].copy_from_slice(&geo.slots_offset.to_le_bytes());
    // highwater, live_count, state, user area start zeroed.
    b[OFF_GENERATION..OFF_GENERATION + 8].copy_from_slice(&final_generation.to_le_bytes());
    let crc = header_crc(&b);
    b[OFF_HEADER_CRC..OFF_HEADER_CRC + 4].copy_from_slice(&crc.to_le_bytes());
    b[OFF_GENERATION..OFF_GENERATION + 8].copy_from_slice(&generation.to_le_bytes());
    b
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> Options {
        Options::new("/tmp/x", 16, 8, 100)
    }

    #[test]
    fn test_align8() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(9), 16);
    }

    #[test]
    fn test_field_offsets_are_aligned() {
        // Atomically-accessed words must be 8-byte aligned.
        for off in [OFF_SLOT_HIGHWATER, OFF_LIVE_COUNT, OFF_GENERATION, OFF_STATE] {
            assert_eq!(off % 8, 0);
        }
        assert_eq!(OFF_RESERVED, 216);
        assert_eq!(OFF_HEADER_CRC, 252);
    }

    #[test]
    fn test_geometry_derivation() {
        let geo = Geometry::from_options(&opts());
        // 2 * 100 = 200 -> 256 buckets.
        assert_eq!(geo.bucket_count, 256);
        // meta (8) + key (16) already aligned -> revision at 24, index at 32.
        assert_eq!(geo.rev_offset, 24);
        assert_eq!(geo.index_offset, 32);
        assert_eq!(geo.slot_size, 40);
        assert_eq!(geo.slots_offset, 256 + 256 * 8);
        assert_eq!(geo.file_len, geo.slots_offset + 100 * 40);
    }

    #[test]
    fn test_geometry_pads_key_and_index() {
        let geo = Geometry::from_options(&Options::new("/tmp/x", 5, 3, 4));
        // meta (8) + key (5) = 13 -> revision at 16.
        assert_eq!(geo.rev_offset, 16);
        assert_eq!(geo.index_offset, 24);
        // 24 + 3 = 27 -> 32.
        assert_eq!(geo.slot_size, 32);
        assert_eq!(geo.bucket_count, 8);
    }

    #[test]
    fn test_header_roundtrip() {
        let o = opts();
        let geo = Geometry::from_options(&o);
        let raw = encode_header(&geo, &o, 2, 2);
        let snap = HeaderSnapshot::decode(&raw);
        assert_eq!(snap.magic, MAGIC);
        assert_eq!(snap.version, FORMAT_VERSION);
        assert_eq!(snap.key_size, 16);
        assert_eq!(snap.generation, 2);
        assert!(snap.reserved_zero);
        assert!(snap.crc_matches(&raw));
        snap.validate(&raw, &geo, &o).unwrap();
    }

    #[test]
    fn test_crc_is_computed_for_final_generation() {
        let o = opts();
        let geo = Geometry::from_options(&o);
        // Image published at generation 1 (odd), CRC valid once flipped to 2.
        let mut raw = encode_header(&geo, &o, 1, 2);
        let snap = HeaderSnapshot::decode(&raw);
        assert_eq!(snap.generation, 1);
        assert!(!snap.crc_matches(&raw));
        raw[OFF_GENERATION..OFF_GENERATION + 8].copy_from_slice(&2u64.to_le_bytes());
        assert!(HeaderSnapshot::decode(&raw).crc_matches(&raw));
    }

    #[test]
    fn test_validate_rejects_bad_magic() {
        let o = opts();
        let geo = Geometry::from_options(&o);
        let mut raw = encode_header(&geo, &o, 2, 2);
        raw[0] ^= 0xFF;
        let snap = HeaderSnapshot::decode(&raw);
        assert!(matches!(snap.validate(&raw, &geo, &o), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_validate_rejects_wrong_version() {
        let o = opts();
        let geo = Geometry::from_options(&o);
        let mut raw = encode_header(&geo, &o, 2, 2);
        raw[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&9u32.to_le_bytes());
        let snap = HeaderSnapshot::decode(&raw);
        assert!(matches!(snap.validate(&raw, &geo, &o), Err(Error::Incompatible(_))));
    }

    #[test]
    fn test_validate_rejects_option_mismatch() {
        let o = opts();
        let geo = Geometry::from_options(&o);
        let raw = encode_header(&geo, &o, 2, 2);
        let snap = HeaderSnapshot::decode(&raw);

        let other = Options::new("/tmp/x", 16, 8, 100).user_version(9);
        let other_geo = Geometry::from_options(&other);
        assert!(matches!(
            snap.validate(&raw, &other_geo, &other),
            Err(Error::Incompatible(_))
        ));

        let other = Options::new("/tmp/x", 16, 8, 100).ordered_keys(true);
        let other_geo = Geometry::from_options(&other);
        assert!(matches!(
            snap.validate(&raw, &other_geo, &other),
            Err(Error::Incompatible(_))
        ));
    }

    #[test]
    fn test_validate_rejects_corrupt_crc() {
        let o = opts();
        let geo = Geometry::from_options(&o);
        let mut raw = encode_header(&geo, &o, 2, 2);
        raw[OFF_USER_DATA] ^= 0x01; // mutate without recomputing the CRC
        let snap = HeaderSnapshot::decode(&raw);
        assert!(matches!(snap.validate(&raw, &geo, &o), Err(Error::Corrupt(_))));
    }
}
