//! Lock-free bitmap allocator.
//!
//! Hands out unique bit positions over a fixed range. The vector store uses
//! one per directory shard to allocate leaf-page groups: each set bit maps to
//! one contiguous RowId range. Acquisition scans from a hint, claims the first
//! zero bit in a word with a fetch-or, and wraps to the start once if the
//! hinted region is exhausted. Release clears the bit and rewinds the hint.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const UNIT_BITS: u32 = 64;

pub struct GlobalBitmap {
    words: Box<[AtomicU64]>,
    bits: u32,
    start_hint: AtomicU32,
}

impl GlobalBitmap {
    /// `bits` is rounded up to a multiple of 64.
    pub fn new(bits: u32) -> GlobalBitmap {
        let words = bits.div_ceil(UNIT_BITS).max(1) as usize;
        GlobalBitmap {
            words: (0..words).map(|_| AtomicU64::new(0)).collect(),
            bits: words as u32 * UNIT_BITS,
            start_hint: AtomicU32::new(0),
        }
    }

    /// Find the first zero bit in `word`, set it, and return its position.
    /// Returns `UNIT_BITS` when the word is full.
    fn ffz_and_set(word: &AtomicU64) -> u32 {
        let mut value = word.load(Ordering::Relaxed);
        loop {
            let zeros = (!value).trailing_zeros();
            if zeros == UNIT_BITS {
                return UNIT_BITS;
            }
            let mask = 1u64 << zeros;
            let old = word.fetch_or(mask, Ordering::AcqRel);
            if old & mask == 0 {
                return zeros;
            }
            // Lost the race for this bit; rescan the updated word.
            value = old;
        }
    }

    fn bump_hint(&self, word_idx: u32) {
        let mut old = self.start_hint.load(Ordering::Relaxed);
        while old < word_idx {
            match self.start_hint.compare_exchange_weak(
                old,
                word_idx,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(v) => old = v,
            }
        }
    }

    /// Claim a free bit. Panics when the whole range is exhausted, which is
    /// an allocator-capacity invariant rather than a recoverable error.
    pub fn acquire(&self) -> u32 {
        loop {
            let start = self.start_hint.load(Ordering::Relaxed);
            for idx in start..self.words.len() as u32 {
                let off = Self::ffz_and_set(&self.words[idx as usize]);
                if off == UNIT_BITS {
                    continue;
                }
                self.bump_hint(idx);
                return idx * UNIT_BITS + off;
            }
            if start == 0 {
                panic!("global bitmap exhausted ({} bits)", self.bits);
            }
            // The hinted region is full; wrap once to the beginning.
            self.start_hint.store(0, Ordering::Relaxed);
        }
    }

    /// Clear a previously acquired bit and rewind the hint if it points past.
    pub fn release(&self, bit: u32) {
        assert!(bit < self.bits);
        let idx = bit / UNIT_BITS;
        let mask = 1u64 << (bit % UNIT_BITS);
        let old = self.words[idx as usize].fetch_and(!mask, Ordering::AcqRel);
        debug_assert!(old & mask != 0, "releasing an unset bit");
        if idx < self.start_hint.load(Ordering::Relaxed) {
            self.start_hint.store(idx, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_acquire_is_dense_from_zero() {
        let bm = GlobalBitmap::new(128);
        for expect in 0..128 {
            assert_eq!(bm.acquire(), expect);
        }
    }

    #[test]
    fn test_release_allows_reuse() {
        let bm = GlobalBitmap::new(64);
        for _ in 0..64 {
            bm.acquire();
        }
        bm.release(17);
        assert_eq!(bm.acquire(), 17);
    }

    #[test]
    #[should_panic(expected = "exhausted")]
    fn test_exhaustion_panics() {
        let bm = GlobalBitmap::new(64);
        for _ in 0..65 {
            bm.acquire();
        }
    }

    #[test]
    fn test_concurrent_acquire_unique() {
        let bm = Arc::new(GlobalBitmap::new(1024));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let bm = bm.clone();
            handles.push(std::thread::spawn(move || {
                (0..128).map(|_| bm.acquire()).collect::<Vec<_>>()
            }));
        }
        let mut seen = HashSet::new();
        for h in handles {
            for bit in h.join().unwrap() {
                assert!(seen.insert(bit), "bit {} handed out twice", bit);
            }
        }
        assert_eq!(seen.len(), 1024);
    }
}
