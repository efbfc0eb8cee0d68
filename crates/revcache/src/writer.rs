// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Write transactions.
//!
//! A [`Writer`] is a short-lived borrow of its [`Cache`]: it buffers puts
//! and deletes in memory and publishes them in one atomic step. Writers are
//! serialized host-wide — the advisory lock excludes other processes, the
//! registry's `active_writer` flag excludes other handles in this process —
//! and they never block: contention is reported as `Busy` immediately.
//!
//! Commit publication follows the seqlock protocol:
//!
//! 1. Bump the generation to odd (Release) — readers start retrying.
//! 2. Apply deletes, in-place updates, and appends; refresh the header
//!    counters, user area, and CRC.
//! 3. In `Writeback::Sync` mode, flush the mapping.
//! 4. Bump the generation to the next even value (Release).
//!
//! Everything that can fail structurally (`Full`, `OutOfOrderInsert`) is
//! checked before step 1, so a failed commit leaves the file untouched.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;

use crate::bucket::{self, Hit};
use crate::cache::Cache;
use crate::error::{Error, Result};
use crate::hash::key_hash;
use crate::layout::{META_USED, STATE_INVALIDATED, USER_DATA_SIZE};
use crate::lock::{self, LockGuard};
use crate::options::Writeback;

#[derive(Debug, Clone)]
enum PendingOp {
    Put { revision: i64, index: Vec<u8> },
    Delete,
}

/// An open transaction on a [`Cache`]. Obtained from
/// [`Cache::begin_write`]; dropped, aborted, or committed exactly once.
pub struct Writer<'a> {
    cache: &'a Cache,
    ops: BTreeMap<Vec<u8>, PendingOp>,
    /// Buffered puts whose key has no live slot; they will consume slots.
    pending_new: u64,
    user_flags: Option<u64>,
    user_data: Option<[u8; USER_DATA_SIZE]>,
    lock_guard: Option<LockGuard>,
    finished: bool,
}

impl std::fmt::Debug for Writer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("buffered_ops", &self.ops.len())
            .field("pending_new", &self.pending_new)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Cache {
    /// Begin a write transaction.
    ///
    /// Fails with `Busy` if any writer — in this process or another — holds
    /// the file. Never blocks.
    pub fn begin_write(&self) -> Result<Writer<'_>> {
        self.ensure_open()?;
        let lock_guard = if self.opts.disable_locking {
            None
        } else {
            Some(lock::try_acquire(&self.lock_path)?)
        };
        {
            let _latch = self.entry.latch.write();
            if self.entry.active_writer.swap(true, Ordering::AcqRel) {
                return Err(Error::Busy("transaction already open on this file"));
            }
        }

        // Exclusivity established: the generation must be stable and even.
        let result = (|| {
            let g = self.generation().load(Ordering::Acquire);
            if g & 1 == 1 {
                return Err(Error::Corrupt(
                    "odd generation with writer lock held (crashed commit)".into(),
                ));
            }
            if self.state_word().load(Ordering::Acquire) == STATE_INVALIDATED {
                return Err(Error::Invalidated);
            }
            Ok(())
        })();
        if let Err(e) = result {
            let _latch = self.entry.latch.write();
            self.entry.active_writer.store(false, Ordering::Release);
            return Err(e);
        }

        Ok(Writer {
            cache: self,
            ops: BTreeMap::new(),
            pending_new: 0,
            user_flags: None,
            user_data: None,
            lock_guard,
            finished: false,
        })
    }
}

impl<'a> Writer<'a> {
    /// Buffer a put. Validates sizes immediately and rejects eagerly with
    /// `Full` when the buffered transaction could no longer fit.
    pub fn put(&mut self, key: &[u8], revision: i64, index: &[u8]) -> Result<()> {
        self.ensure_active()?;
        let cache = self.cache;
        cache.check_key(key)?;
        if index.len() != cache.geo().index_size as usize {
            return Err(Error::InvalidInput(format!(
                "index length {} does not match index_size {}",
                index.len(),
                cache.geo().index_size
            )));
        }

        // A put consumes a slot only when the key has no live slot; live
        // slots are updated in place and buffered deletes do not free any.
        let live = bucket::lookup(cache, key, key_hash(key))?.is_some();
        let counted = !live && matches!(self.ops.get(key), Some(PendingOp::Put { .. }));
        if !live && !counted {
            let highwater = cache.highwater_word().load(Ordering::Acquire);
            if highwater + self.pending_new + 1 > u64::from(cache.geo().slot_capacity) {
                return Err(Error::Full { capacity: cache.geo().slot_capacity });
            }
            self.pending_new += 1;
        }
        self.ops
            .insert(key.to_vec(), PendingOp::Put { revision, index: index.to_vec() });
        Ok(())
    }

    /// Buffer a delete. Returns whether the key was present as seen at
    /// buffering time (a live slot, or an earlier put in this transaction).
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        self.ensure_active()?;
        let cache = self.cache;
        cache.check_key(key)?;

        let live = bucket::lookup(cache, key, key_hash(key))?.is_some();
        let was_present = match self.ops.get(key) {
            Some(PendingOp::Put { .. }) => true,
            Some(PendingOp::Delete) => false,
            None => live,
        };
        if !live && matches!(self.ops.get(key), Some(PendingOp::Put { .. })) {
            self.pending_new -= 1;
        }
        self.ops.insert(key.to_vec(), PendingOp::Delete);
        Ok(was_present)
    }

    /// Stage the caller-owned header flags; published at commit.
    pub fn set_user_header_flags(&mut self, flags: u64) -> Result<()> {
        self.ensure_active()?;
        self.user_flags = Some(flags);
        Ok(())
    }

    /// Stage the caller-owned header data, zero-padded to its fixed size;
    /// published at commit.
    pub fn set_user_header_data(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_active()?;
        if data.len() > USER_DATA_SIZE {
            return Err(Error::InvalidInput(format!(
                "user header data length {} exceeds {}",
                data.len(),
                USER_DATA_SIZE
            )));
        }
        let mut buf = [0u8; USER_DATA_SIZE];
        buf[..data.len()].copy_from_slice(data);
        self.user_data = Some(buf);
        Ok(())
    }

    /// Atomically publish the buffered operations.
    ///
    /// Operations on the same key collapse to the last one buffered. On
    /// `Full` or `OutOfOrderInsert` no byte of the file has been touched.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_active()?;
        let cache = self.cache;
        let geo = *cache.geo();

        // Plan phase: resolve every final operation against the current
        // index without mutating anything.
        let mut deletes: Vec<Hit> = Vec::new();
        let mut updates: Vec<(u32, i64, &[u8])> = Vec::new();
        // BTreeMap iteration yields inserts in ascending key order, which
        // is exactly the append order ordered-keys mode requires.
        let mut inserts: Vec<(&[u8], i64, &[u8])> = Vec::new();
        for (key, op) in &self.ops {
            let hit = bucket::lookup(cache, key, key_hash(key))?;
            match op {
                PendingOp::Delete => {
                    if let Some(hit) = hit {
                        deletes.push(hit);
                    }
                }
                PendingOp::Put { revision, index } => match hit {
                    Some(hit) => updates.push((hit.slot_id, *revision, index.as_slice())),
                    None => inserts.push((key.as_slice(), *revision, index.as_slice())),
                },
            }
        }

        let highwater = cache.highwater_word().load(Ordering::Acquire);
        if highwater + inserts.len() as u64 > u64::from(geo.slot_capacity) {
            return Err(Error::Full { capacity: geo.slot_capacity });
        }
        if geo.ordered_keys && !inserts.is_empty() && highwater > 0 {
            let last = cache.slot_key(highwater as u32 - 1);
            if inserts[0].0 < last {
                return Err(Error::OutOfOrderInsert);
            }
        }

        if deletes.is_empty()
            && updates.is_empty()
            && inserts.is_empty()
            && self.user_flags.is_none()
            && self.user_data.is_none()
        {
            self.finish();
            return Ok(());
        }

        // Publish phase. The latch quiesces same-process readers; readers
        // in other processes ride the generation counter.
        let writeback_error;
        {
            let _latch = cache.entry.latch.write();
            cache.ensure_open()?;

            let generation = cache.generation();
            let g = generation.load(Ordering::Acquire);
            generation.store(g + 1, Ordering::Release);

            let mut live = cache.live_count_word().load(Ordering::Acquire);
            for hit in &deletes {
                let meta = cache.slot_meta(hit.slot_id);
                meta.store(meta.load(Ordering::Acquire) & !META_USED, Ordering::Release);
                bucket::mark_tombstone(cache, hit.bucket_idx);
                live -= 1;
            }
            for (slot_id, revision, index) in &updates {
                cache.slot_revision(*slot_id).store(*revision as u64, Ordering::Release);
                cache.write_slot_index(*slot_id, index);
            }
            let mut new_highwater = highwater;
            for (key, revision, index) in &inserts {
                let id = new_highwater as u32;
                cache.write_slot_key(id, key);
                cache.slot_revision(id).store(*revision as u64, Ordering::Release);
                cache.write_slot_index(id, index);
                cache.slot_meta(id).store(META_USED, Ordering::Release);
                new_highwater += 1;
                cache.highwater_word().store(new_highwater, Ordering::Release);
                bucket::insert(cache, id, key_hash(key))?;
                live += 1;
            }
            cache.live_count_word().store(live, Ordering::Release);

            if let Some(flags) = self.user_flags {
                cache.user_flags_word().store(flags, Ordering::Release);
            }
            if let Some(data) = &self.user_data {
                cache.write_user_data(data);
            }
            cache.recompute_header_crc(g + 2);

            // Durability barrier sits between the odd and even phase; a
            // failure does not unpublish the commit.
            writeback_error = match cache.opts.writeback {
                Writeback::Sync => cache.map_sync().err(),
                Writeback::None => None,
            };

            generation.store(g + 2, Ordering::Release);
        }

        log::debug!(
            "committed {} deletes, {} updates, {} inserts to {}",
            deletes.len(),
            updates.len(),
            inserts.len(),
            cache.path().display()
        );
        self.finish();
        match writeback_error {
            Some(e) => Err(Error::Writeback(e)),
            None => Ok(()),
        }
    }

    /// Discard the buffered operations and release the writer locks.
    pub fn abort(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.finish();
        Ok(())
    }

    /// Release the transaction; a no-op if already committed or aborted.
    pub fn close(&mut self) -> Result<()> {
        if !self.finished {
            self.finish();
        }
        Ok(())
    }

    fn ensure_active(&self) -> Result<()> {
        if self.finished {
            return Err(Error::Closed);
        }
        self.cache.ensure_open()
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        {
            let _latch = self.cache.entry.latch.write();
            self.cache.entry.active_writer.store(false, Ordering::Release);
        }
        self.lock_guard = None;
        self.ops.clear();
        self.pending_new = 0;
    }
}

impl Drop for Writer<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}
