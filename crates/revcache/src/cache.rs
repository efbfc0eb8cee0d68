// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Cache handle: open, point reads, invalidation, teardown.
//!
//! A `Cache` owns one read/write mapping of the file plus a reference on
//! the process-global registry entry that coordinates handles to the same
//! device+inode. Reads never block writers: every read operation takes the
//! per-file latch shared (guarding against handle teardown) and runs inside
//! the seqlock envelope (guarding against concurrent commits, in this
//! process or any other).

use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::bucket;
use crate::error::{Error, Result};
use crate::file::{self, FileId, Map};
use crate::hash::key_hash;
use crate::layout::{
    self, Geometry, HeaderSnapshot, HEADER_SIZE, OFF_GENERATION, OFF_HEADER_CRC, OFF_LIVE_COUNT,
    OFF_SLOT_HIGHWATER, OFF_STATE, OFF_USER_DATA, OFF_USER_FLAGS, STATE_INVALIDATED,
    USER_DATA_SIZE,
};
use crate::lock;
use crate::options::Options;
use crate::registry::{self, FileEntry};
use crate::seqlock;

/// An owned record returned from read operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Key bytes, exactly `key_size` long.
    pub key: Vec<u8>,
    /// Caller-defined signed revision.
    pub revision: i64,
    /// Opaque index payload, exactly `index_size` long (empty if zero).
    pub index: Vec<u8>,
}

/// Caller-owned passthrough bytes stored in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserHeader {
    pub flags: u64,
    pub data: [u8; USER_DATA_SIZE],
}

/// Handle to an open cache file. See the crate docs for the full protocol.
#[derive(Debug)]
pub struct Cache {
    pub(crate) opts: Options,
    geo: Geometry,
    map: Map,
    file_id: FileId,
    pub(crate) entry: Arc<FileEntry>,
    pub(crate) lock_path: std::path::PathBuf,
    closed: AtomicBool,
    registry_released: AtomicBool,
}

impl Cache {
    /// Open or create the cache file described by `opts`.
    ///
    /// A missing or zero-byte file is formatted under the inter-process
    /// writer lock. An existing file is validated on a stable header
    /// snapshot; a generation that stays odd is classified through a
    /// non-blocking lock probe: acquirable means the writer died mid-commit
    /// (`Corrupt`), held means a commit is in flight (`Busy`).
    pub fn open(opts: Options) -> Result<Self> {
        opts.validate()?;
        let geo = Geometry::from_options(&opts);
        let lock_path = lock::lock_path(&opts.path);

        let file = file::open_cache_file(&opts.path)?;
        let (file_id, mut size) = file::stat(&file)?;

        if size == 0 {
            let guard = if opts.disable_locking {
                None
            } else {
                Some(lock::try_acquire(&lock_path)?)
            };
            // Re-check under the lock: another process may have formatted
            // the file between our open and the lock acquisition.
            let (_, current) = file::stat(&file)?;
            if current == 0 {
                file::format(&file, &geo, &opts)?;
            }
            drop(guard);
            size = file::stat(&file)?.1;
        }

        if size != geo.file_len {
            return Err(classify_size_mismatch(&file, &geo, &opts, size, &lock_path));
        }

        let map = Map::map(&file, geo.file_len)?;
        drop(file); // the mapping keeps its own reference

        // SAFETY: OFF_GENERATION is 8-byte aligned and inside the mapping.
        let generation = unsafe { seqlock::atomic_u64_at(map.as_ptr(), OFF_GENERATION) };
        let validated = seqlock::read_envelope(generation, || {
            let mut raw = [0u8; HEADER_SIZE];
            // SAFETY: the mapping is at least HEADER_SIZE bytes (checked
            // against geo.file_len above); torn bytes are tolerated because
            // the envelope revalidates the generation after this copy.
            unsafe {
                ptr::copy_nonoverlapping(map.as_ptr(), raw.as_mut_ptr(), HEADER_SIZE);
            }
            let snap = HeaderSnapshot::decode(&raw);
            snap.validate(&raw, &geo, &opts)?;
            Ok(snap)
        });

        let snap = match validated {
            Ok(snap) => snap,
            Err(Error::Busy(_)) => {
                // The generation stayed odd (or kept moving) through every
                // retry. Without the lock we cannot prove a crash.
                if opts.disable_locking {
                    return Err(Error::Busy("generation odd at open"));
                }
                return match lock::try_acquire(&lock_path) {
                    Ok(_probe) => Err(Error::Corrupt(
                        "odd generation with no live writer (crashed commit)".into(),
                    )),
                    Err(Error::Busy(_)) => Err(Error::Busy("writer active at open")),
                    Err(e) => Err(e),
                };
            }
            Err(e) => return Err(e),
        };

        if snap.state == STATE_INVALIDATED {
            return Err(Error::Invalidated);
        }

        let entry = registry::acquire(file_id);
        log::debug!(
            "opened cache {}: {} live / {} slots, generation {}",
            opts.path.display(),
            snap.live_count,
            geo.slot_capacity,
            snap.generation
        );

        Ok(Self {
            opts,
            geo,
            map,
            file_id,
            entry,
            lock_path,
            closed: AtomicBool::new(false),
            registry_released: AtomicBool::new(false),
        })
    }

    /// Point lookup. Returns an owned copy of the entry, or `None`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Entry>> {
        self.check_key(key)?;
        let _latch = self.entry.latch.read();
        self.ensure_open()?;
        let hash = key_hash(key);
        seqlock::read_envelope(self.generation(), || {
            self.check_state()?;
            match bucket::lookup(self, key, hash)? {
                None => Ok(None),
                Some(hit) => Ok(Some(Entry {
                    key: key.to_vec(),
                    revision: self.slot_revision(hit.slot_id).load(Ordering::Acquire) as i64,
                    index: self.slot_index(hit.slot_id).to_vec(),
                })),
            }
        })
    }

    /// Number of live entries.
    pub fn len(&self) -> Result<u64> {
        let _latch = self.entry.latch.read();
        self.ensure_open()?;
        seqlock::read_envelope(self.generation(), || {
            self.check_state()?;
            Ok(self.live_count_word().load(Ordering::Acquire))
        })
    }

    /// Whether the cache holds no live entries.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Caller-owned header bytes.
    pub fn user_header(&self) -> Result<UserHeader> {
        let _latch = self.entry.latch.read();
        self.ensure_open()?;
        seqlock::read_envelope(self.generation(), || {
            self.check_state()?;
            let flags = self.user_flags_word().load(Ordering::Acquire);
            let mut data = [0u8; USER_DATA_SIZE];
            // SAFETY: the user data area lies inside the header, inside the
            // mapping; the envelope revalidates the generation afterwards.
            unsafe {
                ptr::copy_nonoverlapping(
                    self.map.as_ptr().add(OFF_USER_DATA),
                    data.as_mut_ptr(),
                    USER_DATA_SIZE,
                );
            }
            Ok(UserHeader { flags, data })
        })
    }

    /// Permanently invalidate the cache file.
    ///
    /// Recorded like any commit (odd→even generation, CRC refresh), so
    /// every handle in every process observes it. The file must be removed
    /// and recreated before it can be used again.
    pub fn invalidate(&self) -> Result<()> {
        self.ensure_open()?;
        let _guard = if self.opts.disable_locking {
            None
        } else {
            Some(lock::try_acquire(&self.lock_path)?)
        };

        let _latch = self.entry.latch.write();
        if self.entry.active_writer.swap(true, Ordering::AcqRel) {
            return Err(Error::Busy("transaction open on this file"));
        }
        let result = self.invalidate_locked();
        self.entry.active_writer.store(false, Ordering::Release);
        result
    }

    fn invalidate_locked(&self) -> Result<()> {
        let generation = self.generation();
        let g = generation.load(Ordering::Acquire);
        if g & 1 == 1 {
            return Err(Error::Corrupt(
                "odd generation with writer lock held (crashed commit)".into(),
            ));
        }
        if self.state_word().load(Ordering::Acquire) == STATE_INVALIDATED {
            return Err(Error::Invalidated);
        }

        generation.store(g + 1, Ordering::Release);
        self.state_word().store(STATE_INVALIDATED, Ordering::Release);
        self.recompute_header_crc(g + 2);
        generation.store(g + 2, Ordering::Release);
        log::debug!("invalidated cache {}", self.opts.path.display());
        Ok(())
    }

    /// Release the handle. Subsequent operations return `Closed`; the
    /// mapping itself is unmapped when the handle is dropped.
    pub fn close(&self) -> Result<()> {
        let _latch = self.entry.latch.write();
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::Closed);
        }
        self.release_registry();
        log::debug!("closed cache {}", self.opts.path.display());
        Ok(())
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.opts.path
    }

    /// Immutable slot capacity.
    pub fn capacity(&self) -> u32 {
        self.geo.slot_capacity
    }

    /// Fixed key length in bytes.
    pub fn key_size(&self) -> u32 {
        self.geo.key_size
    }

    /// Fixed index payload length in bytes.
    pub fn index_size(&self) -> u32 {
        self.geo.index_size
    }

    /// Whether the sorted-keys invariant is enforced.
    pub fn ordered_keys(&self) -> bool {
        self.geo.ordered_keys
    }

    // ------------------------------------------------------------------
    // Internal accessors. All raw pointer arithmetic is funneled through
    // these so the SAFETY argument lives in one place: offsets are derived
    // from the validated geometry, every 64-bit control word sits at an
    // 8-byte-aligned offset, and byte ranges are only interpreted by
    // callers holding writer exclusivity or running inside the envelope.
    // ------------------------------------------------------------------

    #[inline]
    pub(crate) fn geo(&self) -> &Geometry {
        &self.geo
    }

    #[inline]
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn check_state(&self) -> Result<()> {
        if self.state_word().load(Ordering::Acquire) == STATE_INVALIDATED {
            return Err(Error::Invalidated);
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.geo.key_size as usize {
            return Err(Error::InvalidInput(format!(
                "key length {} does not match key_size {}",
                key.len(),
                self.geo.key_size
            )));
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn generation(&self) -> &AtomicU64 {
        // SAFETY: fixed 8-aligned header offset inside the mapping.
        unsafe { seqlock::atomic_u64_at(self.map.as_ptr(), OFF_GENERATION) }
    }

    #[inline]
    pub(crate) fn state_word(&self) -> &AtomicU64 {
        // SAFETY: fixed 8-aligned header offset inside the mapping.
        unsafe { seqlock::atomic_u64_at(self.map.as_ptr(), OFF_STATE) }
    }

    #[inline]
    pub(crate) fn highwater_word(&self) -> &AtomicU64 {
        // SAFETY: fixed 8-aligned header offset inside the mapping.
        unsafe { seqlock::atomic_u64_at(self.map.as_ptr(), OFF_SLOT_HIGHWATER) }
    }

    #[inline]
    pub(crate) fn live_count_word(&self) -> &AtomicU64 {
        // SAFETY: fixed 8-aligned header offset inside the mapping.
        unsafe { seqlock::atomic_u64_at(self.map.as_ptr(), OFF_LIVE_COUNT) }
    }

    #[inline]
    pub(crate) fn user_flags_word(&self) -> &AtomicU64 {
        // SAFETY: fixed 8-aligned header offset inside the mapping.
        unsafe { seqlock::atomic_u64_at(self.map.as_ptr(), OFF_USER_FLAGS) }
    }

    #[inline]
    pub(crate) fn bucket_word(&self, idx: u64) -> &AtomicU64 {
        debug_assert!(idx < u64::from(self.geo.bucket_count));
        // SAFETY: the bucket region starts at HEADER_SIZE (8-aligned) and
        // idx is below bucket_count, so the word is inside the mapping.
        unsafe { seqlock::atomic_u64_at(self.map.as_ptr(), self.geo.bucket_offset(idx) as usize) }
    }

    #[inline]
    pub(crate) fn slot_meta(&self, id: u32) -> &AtomicU64 {
        debug_assert!(id < self.geo.slot_capacity);
        // SAFETY: slot offsets are 8-aligned multiples within the mapping.
        unsafe { seqlock::atomic_u64_at(self.map.as_ptr(), self.geo.slot_offset(id) as usize) }
    }

    #[inline]
    pub(crate) fn slot_revision(&self, id: u32) -> &AtomicU64 {
        debug_assert!(id < self.geo.slot_capacity);
        // SAFETY: rev_offset is 8-aligned within an 8-aligned slot.
        unsafe {
            seqlock::atomic_u64_at(
                self.map.as_ptr(),
                self.geo.slot_offset(id) as usize + self.geo.rev_offset as usize,
            )
        }
    }

    /// Borrow the key bytes of a slot straight from the mapping.
    #[inline]
    pub(crate) fn slot_key(&self, id: u32) -> &[u8] {
        debug_assert!(id < self.geo.slot_capacity);
        // SAFETY: the key range lies inside the slot, inside the mapping.
        // The bytes may be concurrently written by a committing writer;
        // callers tolerate that through the envelope or hold exclusivity.
        unsafe {
            std::slice::from_raw_parts(
                self.map.as_ptr().add(self.geo.slot_offset(id) as usize + 8),
                self.geo.key_size as usize,
            )
        }
    }

    /// Borrow the index bytes of a slot straight from the mapping.
    #[inline]
    pub(crate) fn slot_index(&self, id: u32) -> &[u8] {
        debug_assert!(id < self.geo.slot_capacity);
        // SAFETY: as for slot_key; the index range ends before slot_size.
        unsafe {
            std::slice::from_raw_parts(
                self.map
                    .as_ptr()
                    .add(self.geo.slot_offset(id) as usize + self.geo.index_offset as usize),
                self.geo.index_size as usize,
            )
        }
    }

    /// Write the key bytes of a freshly allocated slot (writer only).
    pub(crate) fn write_slot_key(&self, id: u32, key: &[u8]) {
        debug_assert_eq!(key.len(), self.geo.key_size as usize);
        // SAFETY: exclusive writer, range inside the mapping.
        unsafe {
            ptr::copy_nonoverlapping(
                key.as_ptr(),
                self.map.as_ptr().add(self.geo.slot_offset(id) as usize + 8),
                key.len(),
            );
        }
    }

    /// Write the index bytes of a slot (writer only).
    pub(crate) fn write_slot_index(&self, id: u32, index: &[u8]) {
        debug_assert_eq!(index.len(), self.geo.index_size as usize);
        if index.is_empty() {
            return;
        }
        // SAFETY: exclusive writer, range inside the mapping.
        unsafe {
            ptr::copy_nonoverlapping(
                index.as_ptr(),
                self.map
                    .as_ptr()
                    .add(self.geo.slot_offset(id) as usize + self.geo.index_offset as usize),
                index.len(),
            );
        }
    }

    /// Write the caller-owned data area (writer only).
    pub(crate) fn write_user_data(&self, data: &[u8; USER_DATA_SIZE]) {
        // SAFETY: exclusive writer, fixed header range inside the mapping.
        unsafe {
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.map.as_ptr().add(OFF_USER_DATA),
                USER_DATA_SIZE,
            );
        }
    }

    /// Recompute the header CRC for the state the header will have once the
    /// generation flips to `final_generation` (writer only, odd phase).
    pub(crate) fn recompute_header_crc(&self, final_generation: u64) {
        let mut raw = [0u8; HEADER_SIZE];
        // SAFETY: the header prefix is inside the mapping; we hold writer
        // exclusivity so the copy is stable.
        unsafe {
            ptr::copy_nonoverlapping(self.map.as_ptr(), raw.as_mut_ptr(), HEADER_SIZE);
        }
        raw[OFF_GENERATION..OFF_GENERATION + 8].copy_from_slice(&final_generation.to_le_bytes());
        let crc = layout::header_crc(&raw);
        // SAFETY: 4-byte CRC word at a fixed header offset; only read by
        // openers under a stable (even) generation.
        unsafe {
            ptr::copy_nonoverlapping(
                crc.to_le_bytes().as_ptr(),
                self.map.as_ptr().add(OFF_HEADER_CRC),
                4,
            );
        }
    }

    /// Durability barrier over the whole mapping.
    pub(crate) fn map_sync(&self) -> std::io::Result<()> {
        self.map.sync()
    }

    fn release_registry(&self) {
        if !self.registry_released.swap(true, Ordering::AcqRel) {
            registry::release(self.file_id);
        }
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        // Teardown must release the registry reference even when the caller
        // never called close(); the mapping unmaps in Map::drop.
        self.closed.store(true, Ordering::Release);
        self.release_registry();
    }
}

/// Classify a file whose length does not match the requested geometry.
///
/// This path never observes a healthy quiescent cache of the requested
/// shape, so a best-effort unsynchronized header read is acceptable: an odd
/// generation defers to the lock probe (a creator is mid-format, or died
/// there), recorded options that legitimately differ are `Incompatible`,
/// everything else `Corrupt`.
fn classify_size_mismatch(
    file: &std::fs::File,
    geo: &Geometry,
    opts: &Options,
    size: u64,
    lock_path: &Path,
) -> Error {
    let raw = match file::read_header_prefix(file) {
        Ok(Some(raw)) => raw,
        Ok(None) => {
            return Error::Corrupt(format!(
                "file length {} is smaller than the {}-byte header",
                size, HEADER_SIZE
            ))
        }
        Err(e) => return Error::Io(e),
    };
    let snap = HeaderSnapshot::decode(&raw);
    if snap.magic != layout::MAGIC {
        return Error::Corrupt(format!("bad magic {:#018x}", snap.magic));
    }
    if snap.version != layout::FORMAT_VERSION {
        return Error::Incompatible(format!(
            "format version {} (expected {})",
            snap.version,
            layout::FORMAT_VERSION
        ));
    }
    if snap.generation & 1 == 1 {
        if opts.disable_locking {
            return Error::Busy("generation odd at open");
        }
        return match lock::try_acquire(lock_path) {
            Ok(_probe) => {
                Error::Corrupt("odd generation with no live writer (crashed format)".into())
            }
            Err(Error::Busy(_)) => Error::Busy("writer active at open"),
            Err(e) => e,
        };
    }
    let ordered = snap.flags & layout::FLAG_ORDERED_KEYS != 0;
    if snap.key_size != opts.key_size
        || snap.index_size != opts.index_size
        || snap.slot_capacity != opts.slot_capacity
        || ordered != opts.ordered_keys
        || snap.user_version != opts.user_version
    {
        return Error::Incompatible(format!(
            "recorded options (key_size={}, index_size={}, slot_capacity={}, ordered={}, \
             user_version={}) differ from requested",
            snap.key_size, snap.index_size, snap.slot_capacity, ordered, snap.user_version
        ));
    }
    Error::Corrupt(format!(
        "file length {} does not match geometry length {}",
        size, geo.file_len
    ))
}
