// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Inter-process writer lock.
//!
//! An advisory, non-blocking exclusive lock on a sibling `<path>.lock` file.
//! The lock file is created on demand and never deleted; deleting it would
//! allow a second process to lock a fresh inode while the first still holds
//! the old one. Only writers (and file creators) take it; readers never do.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{Error, Result};

/// Holds the advisory lock; released when dropped.
#[derive(Debug)]
pub(crate) struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Path of the lock file for a cache file path.
pub(crate) fn lock_path(cache_path: &Path) -> PathBuf {
    let mut s = OsString::from(cache_path.as_os_str());
    s.push(".lock");
    PathBuf::from(s)
}

/// Try to take the exclusive writer lock without blocking.
///
/// Would-block maps to [`Error::Busy`]; everything else is an I/O failure.
pub(crate) fn try_acquire(lock_path: &Path) -> Result<LockGuard> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(lock_path)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(LockGuard { file }),
        Err(e) if e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
            Err(Error::Busy("writer lock held"))
        }
        Err(e) => Err(Error::Io(e)),
    }
}
