//! Offset sequencing
//!
//! Pure next-offset computation for one (thread, target, request-slot)
//! tuple. The sequencer never performs IO; it turns an access pattern and
//! the previous offset into the next block-aligned offset to issue.
//!
//! Pattern precedence, highest first: random, interlocked-sequential,
//! parallel-async, plain sequential. A `random_ratio` between 1 and 99
//! mixes random dispatches into whichever sequential mode is configured.
//!
//! The sequencer assumes a validated, non-degenerate extent; configurations
//! where fewer than one block fits are rejected by `can_start()` before any
//! thread runs.

use crate::config::TargetSpec;
use rand::Rng;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Sentinel previous-offset value meaning "no IO issued yet - compute the
/// starting offset"
pub const NO_PREVIOUS_OFFSET: u64 = u64::MAX;

/// The single sequential cursor shared by every thread touching an
/// interlocked-sequential target. The atomic fetch-add partitions the
/// offset sequence across threads with no duplicates and no gaps; which
/// thread receives which offset depends only on call order.
#[derive(Debug, Default)]
pub struct SharedCursor {
    counter: AtomicU64,
}

impl SharedCursor {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Claim the next slot index in the round-robin sequence
    #[inline]
    fn claim(&self, slots: u64) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) % slots
    }
}

/// Per-(thread, target) offset generator
#[derive(Debug)]
pub struct OffsetSequencer {
    /// First usable byte of the target extent
    base: u64,
    /// One past the last usable byte
    end: u64,
    block: u64,
    align: u64,
    /// Number of aligned offsets `o` in `[base, end)` with `o + block <= end`
    slots: u64,
    /// Starting offset for this thread: `base + relative_index * stride`
    thread_base: u64,
    random_ratio: u8,
    shared: Option<Arc<SharedCursor>>,
    rng: Xoshiro256PlusPlus,
}

impl OffsetSequencer {
    /// Build a sequencer for `relative_index` against a target whose size
    /// resolved to `size` bytes. `shared` must be the target's cursor when
    /// interlocked-sequential is configured, `None` otherwise.
    pub fn new(
        spec: &TargetSpec,
        size: u64,
        relative_index: usize,
        seed: u64,
        shared: Option<Arc<SharedCursor>>,
    ) -> Self {
        debug_assert_eq!(spec.interlocked_sequential, shared.is_some());

        let (base, end) = crate::target::usable_extent(spec, size);
        let block = spec.block_size;
        let align = spec.effective_alignment();
        // Validated upstream: at least one block fits past the base.
        let slots = (end - base - block) / align + 1;

        // Interlocked-sequential disallows thread stride; every thread
        // shares the plain base.
        let thread_base = if spec.interlocked_sequential {
            base
        } else {
            base + spec.thread_stride * relative_index as u64
        };

        Self {
            base,
            end,
            block,
            align,
            slots,
            thread_base,
            random_ratio: spec.random_ratio,
            shared,
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
        }
    }

    /// Starting offset for this thread's sequential walk
    #[inline]
    pub fn thread_base_offset(&self) -> u64 {
        self.thread_base
    }

    /// Compute the next offset given the previous one returned for the same
    /// (thread, target, request-slot). Pass [`NO_PREVIOUS_OFFSET`] for the
    /// first call.
    pub fn next_offset(&mut self, previous: u64) -> u64 {
        if self.random_ratio >= 100 {
            return self.random_offset();
        }
        if self.random_ratio > 0 && self.rng.gen_range(0..100u8) < self.random_ratio {
            return self.random_offset();
        }
        if let Some(cursor) = &self.shared {
            let idx = cursor.claim(self.slots);
            return self.base + idx * self.align;
        }
        self.sequential_next(previous)
    }

    /// Starting offset for request-slot `slot` under parallel-async, where
    /// the cursor lives in the request rather than the target. Each slot
    /// fans out one stride past the previous slot, wrapping over the
    /// aligned slot space.
    pub fn parallel_start_offset(&self, slot: usize) -> u64 {
        let from_base = (self.thread_base.saturating_sub(self.base)) / self.align;
        let idx = (from_base + slot as u64) % self.slots;
        self.base + idx * self.align
    }

    #[inline]
    fn sequential_next(&mut self, previous: u64) -> u64 {
        if previous == NO_PREVIOUS_OFFSET {
            return self.thread_base;
        }
        let next = previous + self.align;
        if next + self.block > self.end {
            self.thread_base
        } else {
            next
        }
    }

    #[inline]
    fn random_offset(&mut self) -> u64 {
        let idx = self.rng.gen_range(0..self.slots);
        self.base + idx * self.align
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn spec(base: u64, align: u64, block: u64) -> TargetSpec {
        TargetSpec {
            path: PathBuf::from("/tmp/seq.dat"),
            block_size: block,
            base_offset: base,
            alignment: align,
            ..Default::default()
        }
    }

    #[test]
    fn test_sequential_wraparound() {
        // base 1000, align 500, block 1000, file size 3000:
        // 1000, 1500, 2000, then wrap back to 1000.
        let mut seq = OffsetSequencer::new(&spec(1000, 500, 1000), 3000, 0, 7, None);
        let mut prev = NO_PREVIOUS_OFFSET;
        let mut seen = Vec::new();
        for _ in 0..7 {
            prev = seq.next_offset(prev);
            seen.push(prev);
        }
        assert_eq!(seen, vec![1000, 1500, 2000, 1000, 1500, 2000, 1000]);
    }

    #[test]
    fn test_thread_base_offsets() {
        let mut s = spec(1000, 500, 1000);
        s.thread_stride = 500;
        let seq0 = OffsetSequencer::new(&s, 8000, 0, 7, None);
        let seq3 = OffsetSequencer::new(&s, 8000, 3, 7, None);
        assert_eq!(seq0.thread_base_offset(), 1000);
        assert_eq!(seq3.thread_base_offset(), 2500);
    }

    #[test]
    fn test_interlocked_base_ignores_thread_index() {
        let mut s = spec(1000, 500, 1000);
        s.interlocked_sequential = true;
        let cursor = Arc::new(SharedCursor::new());
        let seq = OffsetSequencer::new(&s, 3000, 5, 7, Some(cursor));
        assert_eq!(seq.thread_base_offset(), 1000);
    }

    #[test]
    fn test_interlocked_partitioning() {
        // Two sequencers sharing one cursor must jointly produce the plain
        // sequential sequence with no duplicates and no gaps.
        let mut s = spec(1000, 500, 1000);
        s.interlocked_sequential = true;
        let cursor = Arc::new(SharedCursor::new());
        let mut a = OffsetSequencer::new(&s, 3000, 0, 1, Some(cursor.clone()));
        let mut b = OffsetSequencer::new(&s, 3000, 1, 2, Some(cursor));

        let o1 = a.next_offset(NO_PREVIOUS_OFFSET);
        let o2 = b.next_offset(NO_PREVIOUS_OFFSET);
        let o3 = a.next_offset(o1);
        let o4 = b.next_offset(o2);
        let o5 = a.next_offset(o3);
        assert_eq!(vec![o1, o2, o3, o4, o5], vec![1000, 1500, 2000, 1000, 1500]);
    }

    #[test]
    fn test_random_in_bounds_and_aligned() {
        let mut s = spec(4096, 512, 4096);
        s.random_ratio = 100;
        let size = 1024 * 1024;
        let mut seq = OffsetSequencer::new(&s, size, 0, 42, None);
        for _ in 0..10_000 {
            let o = seq.next_offset(NO_PREVIOUS_OFFSET);
            assert!(o >= 4096);
            assert!(o + 4096 <= size);
            assert_eq!(o % 512, 0);
        }
    }

    #[test]
    fn test_random_reseed_restartable() {
        let mut s = spec(0, 4096, 4096);
        s.random_ratio = 100;
        let mut a = OffsetSequencer::new(&s, 1 << 20, 0, 99, None);
        let mut b = OffsetSequencer::new(&s, 1 << 20, 0, 99, None);
        for _ in 0..100 {
            assert_eq!(
                a.next_offset(NO_PREVIOUS_OFFSET),
                b.next_offset(NO_PREVIOUS_OFFSET)
            );
        }
    }

    #[test]
    fn test_mixed_ratio_produces_both_kinds() {
        let mut s = spec(0, 4096, 4096);
        s.random_ratio = 50;
        let mut seq = OffsetSequencer::new(&s, 1 << 24, 0, 3, None);
        let mut prev = NO_PREVIOUS_OFFSET;
        let mut sequential_hits = 0;
        let mut jumps = 0;
        for _ in 0..1000 {
            let next = seq.next_offset(prev);
            if prev != NO_PREVIOUS_OFFSET {
                if next == prev + 4096 {
                    sequential_hits += 1;
                } else {
                    jumps += 1;
                }
            }
            prev = next;
        }
        assert!(sequential_hits > 0);
        assert!(jumps > 0);
    }

    #[test]
    fn test_parallel_start_offsets_fan_out() {
        let s = spec(1000, 500, 1000);
        let seq = OffsetSequencer::new(&s, 3000, 0, 7, None);
        assert_eq!(seq.parallel_start_offset(0), 1000);
        assert_eq!(seq.parallel_start_offset(1), 1500);
        assert_eq!(seq.parallel_start_offset(2), 2000);
        // Wraps over the three valid slots
        assert_eq!(seq.parallel_start_offset(3), 1000);
    }

    #[test]
    fn test_max_size_caps_extent() {
        let mut s = spec(0, 4096, 4096);
        s.max_size = 3 * 4096;
        let mut seq = OffsetSequencer::new(&s, 1 << 20, 0, 7, None);
        let mut prev = NO_PREVIOUS_OFFSET;
        for _ in 0..10 {
            prev = seq.next_offset(prev);
            assert!(prev + 4096 <= 3 * 4096);
        }
    }
}
