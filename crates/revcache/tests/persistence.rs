// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reopen persistence, compatibility checks, and corruption detection.
//!
//! The out-of-band corruption tests hardcode the layout for the geometry
//! `key_size=4, index_size=4, slot_capacity=8`: 256-byte header,
//! 16 buckets at offset 256, slots at offset 384, 32 bytes per slot
//! (meta 8 | key 4 | pad 4 | revision 8 | index 4 | pad 4), 640-byte file.

use std::os::unix::fs::FileExt;

use revcache::{Cache, Error, Options, ScanOpts};

const OFF_GENERATION: u64 = 64;
const OFF_USER_DATA: u64 = 88;
const SLOTS_OFFSET: u64 = 384;
const SLOT_SIZE: u64 = 32;

fn opts(dir: &tempfile::TempDir) -> Options {
    Options::new(dir.path().join("c.rvc"), 4, 4, 8)
}

fn populate(dir: &tempfile::TempDir) -> Vec<revcache::Entry> {
    let cache = Cache::open(opts(dir)).unwrap();
    for i in 0..4u8 {
        let mut txn = cache.begin_write().unwrap();
        txn.put(&[b'k', b'e', b'y', i], i64::from(i) * 10, &[i; 4]).unwrap();
        txn.commit().unwrap();
    }
    let mut txn = cache.begin_write().unwrap();
    txn.delete(b"key\x01").unwrap();
    txn.commit().unwrap();
    cache.scan(ScanOpts::default()).unwrap()
}

fn rewrite(dir: &tempfile::TempDir, offset: u64, bytes: &[u8]) {
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(dir.path().join("c.rvc"))
        .unwrap();
    file.write_all_at(bytes, offset).unwrap();
}

#[test]
fn test_reopen_preserves_state() {
    let dir = tempfile::tempdir().unwrap();
    let before = populate(&dir);

    let cache = Cache::open(opts(&dir)).unwrap();
    assert_eq!(cache.len().unwrap(), before.len() as u64);
    assert_eq!(cache.scan(ScanOpts::default()).unwrap(), before);
    assert!(cache.get(b"key\x01").unwrap().is_none());
    let entry = cache.get(b"key\x02").unwrap().unwrap();
    assert_eq!(entry.revision, 20);
}

#[test]
fn test_reopen_preserves_user_header() {
    let dir = tempfile::tempdir().unwrap();
    {
        let cache = Cache::open(opts(&dir)).unwrap();
        let mut txn = cache.begin_write().unwrap();
        txn.set_user_header_flags(42).unwrap();
        txn.set_user_header_data(b"tag").unwrap();
        txn.commit().unwrap();
    }
    let cache = Cache::open(opts(&dir)).unwrap();
    let hdr = cache.user_header().unwrap();
    assert_eq!(hdr.flags, 42);
    assert_eq!(&hdr.data[..3], b"tag");
}

#[test]
fn test_reopen_rejects_option_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    populate(&dir);
    let path = dir.path().join("c.rvc");

    // Different slot layout (file length changes).
    let r = Cache::open(Options::new(&path, 8, 4, 8));
    assert!(matches!(r, Err(Error::Incompatible(_))));
    let r = Cache::open(Options::new(&path, 4, 4, 16));
    assert!(matches!(r, Err(Error::Incompatible(_))));

    // Same layout, different recorded flags/tags.
    let r = Cache::open(Options::new(&path, 4, 4, 8).ordered_keys(true));
    assert!(matches!(r, Err(Error::Incompatible(_))));
    let r = Cache::open(Options::new(&path, 4, 4, 8).user_version(9));
    assert!(matches!(r, Err(Error::Incompatible(_))));
}

#[test]
fn test_user_version_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("v.rvc");
    drop(Cache::open(Options::new(&path, 4, 4, 8).user_version(3)).unwrap());
    assert!(Cache::open(Options::new(&path, 4, 4, 8).user_version(3)).is_ok());
    assert!(matches!(
        Cache::open(Options::new(&path, 4, 4, 8)),
        Err(Error::Incompatible(_))
    ));
}

#[test]
fn test_corrupt_magic() {
    let dir = tempfile::tempdir().unwrap();
    populate(&dir);
    rewrite(&dir, 0, &[0xFF]);
    assert!(matches!(Cache::open(opts(&dir)), Err(Error::Corrupt(_))));
}

#[test]
fn test_wrong_version_is_incompatible() {
    let dir = tempfile::tempdir().unwrap();
    populate(&dir);
    rewrite(&dir, 8, &99u32.to_le_bytes());
    assert!(matches!(Cache::open(opts(&dir)), Err(Error::Incompatible(_))));
}

#[test]
fn test_corrupt_header_crc() {
    let dir = tempfile::tempdir().unwrap();
    populate(&dir);
    // Mutate a CRC-covered byte without refreshing the CRC.
    rewrite(&dir, OFF_USER_DATA, &[0xAB]);
    assert!(matches!(Cache::open(opts(&dir)), Err(Error::Corrupt(_))));
}

#[test]
fn test_truncated_file_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    populate(&dir);
    let path = dir.path().join("c.rvc");
    let len = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 1).unwrap();
    assert!(matches!(Cache::open(opts(&dir)), Err(Error::Corrupt(_))));

    file.set_len(128).unwrap();
    assert!(matches!(Cache::open(opts(&dir)), Err(Error::Corrupt(_))));
}

#[test]
fn test_reserved_meta_bit_corrupts_scan_not_unrelated_get() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Cache::open(opts(&dir)).unwrap();
    let mut txn = cache.begin_write().unwrap();
    txn.put(b"keyA", 1, b"aaaa").unwrap();
    txn.commit().unwrap();
    drop(txn);
    let mut txn = cache.begin_write().unwrap();
    txn.put(b"keyB", 2, b"bbbb").unwrap();
    txn.commit().unwrap();
    drop(txn);
    drop(cache);

    // Set a reserved meta bit on slot 1 (keyB).
    let meta_off = SLOTS_OFFSET + SLOT_SIZE;
    rewrite(&dir, meta_off, &3u64.to_le_bytes());

    let cache = Cache::open(opts(&dir)).unwrap();
    // keyA probes a different bucket chain; its read never loads slot 1.
    assert_eq!(cache.get(b"keyA").unwrap().unwrap().revision, 1);
    // A scan visits every slot and must report the damage.
    assert!(matches!(cache.scan(ScanOpts::default()), Err(Error::Corrupt(_))));
    assert!(matches!(cache.get(b"keyB"), Err(Error::Corrupt(_))));
}

#[test]
fn test_crashed_writer_classification() {
    let dir = tempfile::tempdir().unwrap();
    populate(&dir);

    // Force an odd generation, as a writer that died mid-commit would.
    rewrite(&dir, OFF_GENERATION, &3u64.to_le_bytes());

    // No live lock holder: the odd generation proves a crashed commit.
    assert!(matches!(Cache::open(opts(&dir)), Err(Error::Corrupt(_))));

    // With the writer lock held, the same bytes mean a commit in flight.
    let lock_file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(dir.path().join("c.rvc.lock"))
        .unwrap();
    fs2::FileExt::try_lock_exclusive(&lock_file).unwrap();
    assert!(matches!(Cache::open(opts(&dir)), Err(Error::Busy(_))));
    fs2::FileExt::unlock(&lock_file).unwrap();
}

#[test]
fn test_invalidate_blocks_use_until_recreated() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("c.rvc");
    let cache = Cache::open(opts(&dir)).unwrap();
    let mut txn = cache.begin_write().unwrap();
    txn.put(b"keyA", 1, b"aaaa").unwrap();
    txn.commit().unwrap();
    drop(txn);

    cache.invalidate().unwrap();
    assert!(matches!(cache.get(b"keyA"), Err(Error::Invalidated)));
    assert!(matches!(cache.len(), Err(Error::Invalidated)));
    assert!(matches!(cache.begin_write(), Err(Error::Invalidated)));
    assert!(matches!(cache.invalidate(), Err(Error::Invalidated)));
    drop(cache);

    // A fresh open observes the invalidated state.
    assert!(matches!(Cache::open(opts(&dir)), Err(Error::Invalidated)));

    // Reopen requires removing and recreating the file.
    std::fs::remove_file(&path).unwrap();
    let cache = Cache::open(opts(&dir)).unwrap();
    assert_eq!(cache.len().unwrap(), 0);
}

#[test]
fn test_lock_file_left_behind() {
    let dir = tempfile::tempdir().unwrap();
    populate(&dir);
    // The advisory lock file is created on demand and never deleted.
    assert!(dir.path().join("c.rvc.lock").exists());
}

#[test]
fn test_open_missing_directory_is_io() {
    let r = Cache::open(Options::new("/nonexistent-dir-zz/c.rvc", 4, 4, 8));
    assert!(matches!(r, Err(Error::Io(_))));
}
