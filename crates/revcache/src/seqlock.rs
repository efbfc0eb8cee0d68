// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Seqlock read protocol over the shared mapping.
//!
//! Writers bump the header generation counter to an odd value before any
//! payload mutation and to the next even value after it. Readers never
//! block a writer:
//!
//! 1. Load `g1 = generation` (Acquire); if odd, a commit is in flight —
//!    back off and retry.
//! 2. Read the payload (atomic words for 64-bit fields, byte copies for
//!    key/index ranges).
//! 3. Load `g2 = generation` (Acquire); if `g2 != g1` the read overlapped a
//!    commit — retry.
//!
//! An impossible state observed mid-read (reserved meta bits, a bucket
//! referencing a slot past the highwater, a descending key pair in ordered
//! mode) is corruption only if the generation is still `g1`; if the counter
//! moved, the bytes were torn by a live writer and the observation is
//! overlap, not damage. After [`MAX_READ_RETRIES`] attempts the reader
//! reports `Busy`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{Error, Result};

/// Attempts before a reader gives up with `Busy`.
pub(crate) const MAX_READ_RETRIES: u32 = 64;

/// Backoff cap between retries.
const MAX_BACKOFF_MICROS: u64 = 100;

/// Spin-then-sleep backoff: the first few attempts spin (a commit is a few
/// hundred nanoseconds away from finishing in the common case), later ones
/// sleep with exponential growth capped at [`MAX_BACKOFF_MICROS`].
#[derive(Debug, Default)]
pub(crate) struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub(crate) fn new() -> Self {
        Self { attempt: 0 }
    }

    pub(crate) fn wait(&mut self) {
        if self.attempt < 4 {
            for _ in 0..(1u32 << self.attempt) {
                std::hint::spin_loop();
            }
        } else {
            let exp = (self.attempt - 4).min(7);
            let micros = (1u64 << exp).min(MAX_BACKOFF_MICROS);
            std::thread::sleep(Duration::from_micros(micros));
        }
        self.attempt = self.attempt.saturating_add(1);
    }
}

/// Reference an aligned 64-bit word of the mapping as an atomic.
///
/// # Safety
///
/// `off` must be 8-byte aligned and `base + off .. base + off + 8` must lie
/// inside a live mapping.
#[inline]
pub(crate) unsafe fn atomic_u64_at<'a>(base: *mut u8, off: usize) -> &'a AtomicU64 {
    debug_assert_eq!(off % 8, 0);
    &*base.add(off).cast::<AtomicU64>()
}

/// Run `op` inside the read-retry envelope.
///
/// `op` runs with an even generation sample taken before it; its result is
/// kept only if the counter is unchanged afterwards. A `Corrupt` error from
/// `op` is re-checked against the counter: unchanged means genuine
/// corruption, moved means overlap and the attempt is retried.
pub(crate) fn read_envelope<T>(
    generation: &AtomicU64,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut backoff = Backoff::new();
    for _ in 0..MAX_READ_RETRIES {
        let g1 = generation.load(Ordering::Acquire);
        if g1 & 1 == 1 {
            backoff.wait();
            continue;
        }
        match op() {
            Ok(v) => {
                if generation.load(Ordering::Acquire) == g1 {
                    return Ok(v);
                }
            }
            Err(Error::Corrupt(msg)) => {
                if generation.load(Ordering::Acquire) == g1 {
                    return Err(Error::Corrupt(msg));
                }
                // The impossible state was a torn read under a live commit.
            }
            Err(e) => return Err(e),
        }
        backoff.wait();
    }
    Err(Error::Busy("seqlock retries exhausted"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_clean_read_passes_through() {
        let generation = AtomicU64::new(4);
        let v = read_envelope(&generation, || Ok(42u32)).unwrap();
        assert_eq!(v, 42);
    }

    #[test]
    fn test_permanently_odd_generation_is_busy() {
        let generation = AtomicU64::new(5);
        let r: Result<()> = read_envelope(&generation, || panic!("must not read under odd"));
        assert!(matches!(r, Err(Error::Busy(_))));
    }

    #[test]
    fn test_generation_move_triggers_retry() {
        let generation = AtomicU64::new(0);
        let mut calls = 0;
        let v = read_envelope(&generation, || {
            calls += 1;
            if calls == 1 {
                // Simulate a commit landing mid-read.
                generation.store(2, Ordering::Release);
            }
            Ok(calls)
        })
        .unwrap();
        assert_eq!(v, 2);
    }

    #[test]
    fn test_corrupt_with_stable_generation_surfaces() {
        let generation = AtomicU64::new(2);
        let r: Result<()> =
            read_envelope(&generation, || Err(Error::Corrupt("reserved bits".into())));
        assert!(matches!(r, Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_corrupt_with_moved_generation_is_overlap() {
        let generation = AtomicU64::new(0);
        let mut calls = 0;
        let v = read_envelope(&generation, || {
            calls += 1;
            if calls == 1 {
                generation.store(2, Ordering::Release);
                return Err(Error::Corrupt("torn".into()));
            }
            Ok(calls)
        })
        .unwrap();
        assert_eq!(v, 2);
    }

    #[test]
    fn test_non_corrupt_errors_are_not_retried() {
        let generation = AtomicU64::new(0);
        let mut calls = 0;
        let r: Result<()> = read_envelope(&generation, || {
            calls += 1;
            Err(Error::Invalidated)
        });
        assert!(matches!(r, Err(Error::Invalidated)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_concurrent_writer_never_tears() {
        // Two data words flipped together between (0, 0) and (u64::MAX,
        // u64::MAX) under odd/even generation bumps; a reader must never
        // observe a mixed pair.
        let generation = Arc::new(AtomicU64::new(0));
        let a = Arc::new(AtomicU64::new(0));
        let b = Arc::new(AtomicU64::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let writer = {
            let (generation, a, b, stop) =
                (generation.clone(), a.clone(), b.clone(), stop.clone());
            std::thread::spawn(move || {
                let mut val = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    val = if val == 0 { u64::MAX } else { 0 };
                    let g = generation.load(Ordering::Relaxed);
                    generation.store(g + 1, Ordering::Release);
                    a.store(val, Ordering::Relaxed);
                    b.store(val, Ordering::Relaxed);
                    generation.store(g + 2, Ordering::Release);
                }
            })
        };

        for _ in 0..10_000 {
            let r = read_envelope(&generation, || {
                Ok((a.load(Ordering::Relaxed), b.load(Ordering::Relaxed)))
            });
            if let Ok((x, y)) = r {
                assert_eq!(x, y, "torn read escaped the envelope");
            }
        }

        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();
    }
}
