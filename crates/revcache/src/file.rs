// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! File & mapping layer.
//!
//! Opens or creates the backing file, derives its device+inode identity for
//! intra-process coordination, maps it read/write over its whole length, and
//! guarantees unmap on teardown. Formatting a fresh file publishes an odd
//! generation in the header *before* the region grows to full size, so a
//! concurrent opener either sees a zero-byte file or an odd generation —
//! both of which resolve to `Busy` while the creator holds the writer lock.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;
use std::sync::atomic::Ordering;

use crate::bucket;
use crate::error::{Error, Result};
use crate::layout::{self, Geometry, HEADER_SIZE};
use crate::options::Options;
use crate::seqlock;

/// Identity of an open file: device + inode.
///
/// Keys the process-global registry so two handles to the same file share
/// one coordination entry even when opened through different paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FileId {
    pub dev: u64,
    pub ino: u64,
}

/// Open (or create empty) the cache file read/write.
pub(crate) fn open_cache_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).create(true).open(path)
}

/// Device+inode identity and current length of an open file.
pub(crate) fn stat(file: &File) -> io::Result<(FileId, u64)> {
    let md = file.metadata()?;
    Ok((FileId { dev: md.dev(), ino: md.ino() }, md.len()))
}

/// Read the fixed-size header prefix, or `None` if the file is shorter.
///
/// Only used for error classification when the file length does not match
/// the requested geometry; the authoritative header read goes through the
/// mapping under the seqlock envelope.
pub(crate) fn read_header_prefix(file: &File) -> io::Result<Option<[u8; HEADER_SIZE]>> {
    let mut buf = [0u8; HEADER_SIZE];
    match file.read_exact_at(&mut buf, 0) {
        Ok(()) => Ok(Some(buf)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

/// A read/write shared mapping of the whole cache file.
///
/// Unmapped on drop. The file descriptor itself can be closed immediately
/// after mapping; the mapping keeps its own reference.
#[derive(Debug)]
pub(crate) struct Map {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: the mapping is shared memory accessed from multiple threads and
// processes. All 64-bit control words are accessed through atomics; payload
// byte ranges are guarded by the seqlock envelope or by writer exclusivity.
unsafe impl Send for Map {}
unsafe impl Sync for Map {}

impl Map {
    /// Map `len` bytes of `file` read/write, shared.
    pub(crate) fn map(file: &File, len: u64) -> Result<Self> {
        let len = usize::try_from(len)
            .map_err(|_| Error::InvalidInput("file length exceeds address space".into()))?;

        // SAFETY:
        // - First argument null lets the kernel choose the address.
        // - PROT_READ | PROT_WRITE with MAP_SHARED creates a mapping visible
        //   to every process mapping the same file.
        // - fd is valid for the lifetime of this call (we hold &File).
        // - mmap returns MAP_FAILED on error, checked below.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(Self { ptr: ptr.cast::<u8>(), len })
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    /// Durability barrier: synchronous flush of the whole mapped region.
    pub(crate) fn sync(&self) -> io::Result<()> {
        // SAFETY: ptr/len describe exactly the region returned by mmap.
        let ret = unsafe { libc::msync(self.ptr.cast::<libc::c_void>(), self.len, libc::MS_SYNC) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Map {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and Drop runs once.
        unsafe {
            libc::munmap(self.ptr.cast::<libc::c_void>(), self.len);
        }
    }
}

/// Format a zero-byte file into an empty cache.
///
/// The caller must hold the inter-process writer lock (or have locking
/// disabled). Publication order:
///
/// 1. Header bytes with an odd generation (and the CRC of the final image)
///    are written while the file is still header-sized.
/// 2. The file grows to full length (zero-filled by the kernel).
/// 3. Every bucket word is set to EMPTY through the mapping.
/// 4. The generation flips to its first even value.
pub(crate) fn format(file: &File, geo: &Geometry, opts: &Options) -> Result<()> {
    let header = layout::encode_header(geo, opts, 1, 2);
    file.write_all_at(&header, 0)?;
    file.set_len(geo.file_len)?;

    let map = Map::map(file, geo.file_len)?;

    // SAFETY: the bucket region starts at HEADER_SIZE (8-byte aligned) and
    // spans bucket_count u64 words, all inside the mapping. No other writer
    // exists: the generation is odd and the caller holds the writer lock.
    unsafe {
        let words = map.as_ptr().add(HEADER_SIZE).cast::<u64>();
        for i in 0..geo.bucket_count as usize {
            words.add(i).write(bucket::EMPTY_WORD);
        }
    }

    // SAFETY: OFF_GENERATION is 8-byte aligned and within the mapping.
    let generation = unsafe { seqlock::atomic_u64_at(map.as_ptr(), layout::OFF_GENERATION) };
    generation.store(2, Ordering::Release);

    log::debug!(
        "formatted cache file: {} slots, {} buckets, {} bytes",
        geo.slot_capacity,
        geo.bucket_count,
        geo.file_len
    );
    Ok(())
}
