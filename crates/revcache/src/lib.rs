// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # revcache - embedded single-file memory-mapped revision cache
//!
//! A fixed-layout key/value cache shared between processes through one
//! memory-mapped file. Records have a homogeneous shape: a fixed-size key,
//! a signed 64-bit revision, and an optional fixed-size opaque index
//! payload. Capacity and schema are chosen at creation time and immutable.
//!
//! ## Quick Start
//!
//! ```no_run
//! use revcache::{Cache, Options, ScanOpts};
//!
//! fn main() -> revcache::Result<()> {
//!     let cache = Cache::open(Options::new("/tmp/pkg.rvc", 4, 4, 1024))?;
//!
//!     let mut txn = cache.begin_write()?;
//!     txn.put(b"\x00\x00\x00\x01", 5, b"\xDE\xAD\xBE\xEF")?;
//!     txn.commit()?;
//!
//!     let entry = cache.get(b"\x00\x00\x00\x01")?.expect("just committed");
//!     assert_eq!(entry.revision, 5);
//!
//!     for entry in cache.scan(ScanOpts::default())? {
//!         println!("{:?} @ {}", entry.key, entry.revision);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                       Cache / Writer API                     |
//! |   Open | Get | Len | Scan* | BeginWrite -> Put/Delete/Commit |
//! +--------------------------------------------------------------+
//! |  Bucket index (linear probing)  |  Slot array (append-only)  |
//! +--------------------------------------------------------------+
//! |  Seqlock generation protocol  |  Advisory writer lock        |
//! +--------------------------------------------------------------+
//! |          Memory-mapped file (fixed little-endian layout)     |
//! +--------------------------------------------------------------+
//! ```
//!
//! ## Concurrency Model
//!
//! - **One writer host-wide**: an advisory lock on `<path>.lock` plus a
//!   per-file in-process latch serialize transactions; a second
//!   `begin_write` anywhere reports `Busy` immediately, never blocks.
//! - **Lock-free readers**: reads snapshot the header generation counter,
//!   copy, and revalidate; a commit in flight makes them retry with
//!   bounded backoff. Readers observe exactly one transaction boundary —
//!   the pre-commit state or the post-commit state, never a mix.
//! - **Crash classification**: a generation left odd by a dead writer is
//!   distinguished from a live commit by probing the advisory lock.
//!
//! ## Durability
//!
//! Commits update the mapping; with [`Writeback::Sync`] an `msync` barrier
//! runs inside the publication window, and a barrier failure is reported as
//! `Writeback` while the commit stays visible.

mod bucket;
mod cache;
mod error;
mod file;
mod hash;
mod layout;
mod lock;
mod options;
mod registry;
mod scan;
mod seqlock;
mod writer;

pub use cache::{Cache, Entry, UserHeader};
pub use error::{Error, Result};
pub use layout::USER_DATA_SIZE;
pub use options::{Options, Writeback, MAX_INDEX_SIZE, MAX_KEY_SIZE, MAX_SLOT_CAPACITY};
pub use scan::{PrefixSpec, ScanOpts, MAX_SCAN_BOUND};
pub use writer::Writer;
