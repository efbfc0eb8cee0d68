// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-global per-file coordination.
//!
//! The advisory lock in `lock.rs` excludes writers in *other* processes;
//! two handles inside one process share the lock's open-file semantics but
//! still need a latch so a reader never observes the mapping mid-teardown
//! and two in-process writers exclude each other even with locking disabled.
//!
//! Entries are keyed by device+inode and reference-counted: created on the
//! first open of a file, removed when the last handle releases.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::file::FileId;

/// Shared coordination state for one underlying file.
#[derive(Debug)]
pub(crate) struct FileEntry {
    /// Readers hold this shared while touching the mapping; a writer holds
    /// it exclusively while mutating and while flipping `active_writer`.
    pub latch: RwLock<()>,
    /// Set while a transaction is open on this file in this process.
    pub active_writer: AtomicBool,
    refs: AtomicU64,
}

impl FileEntry {
    fn new() -> Self {
        Self {
            latch: RwLock::new(()),
            active_writer: AtomicBool::new(false),
            refs: AtomicU64::new(0),
        }
    }
}

fn registry() -> &'static DashMap<FileId, Arc<FileEntry>> {
    static REGISTRY: OnceLock<DashMap<FileId, Arc<FileEntry>>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

/// Find or create the entry for `id` and take a reference on it.
pub(crate) fn acquire(id: FileId) -> Arc<FileEntry> {
    let entry = registry().entry(id).or_insert_with(|| Arc::new(FileEntry::new()));
    // Incremented under the shard guard so a concurrent release cannot
    // remove the entry between lookup and increment.
    entry.refs.fetch_add(1, Ordering::AcqRel);
    entry.value().clone()
}

/// Drop one reference; the entry disappears when the count reaches zero.
pub(crate) fn release(id: FileId) {
    registry().remove_if(&id, |_, e| e.refs.fetch_sub(1, Ordering::AcqRel) == 1);
}
