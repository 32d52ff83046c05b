//! IO request slots
//!
//! Each worker thread owns a fixed arena of `IoRequest` slots, one per
//! overlapped operation it keeps in flight. A slot carries everything one
//! operation needs: the weighted rotation over the thread's targets, the
//! aligned read buffer, a view into the shared write-content buffer, and
//! the dispatch timestamp used for latency measurement. The slot index
//! doubles as the backend token, so completions map straight back to their
//! slot without any lookup table.

use crate::sequencer::NO_PREVIOUS_OFFSET;
use crate::util::buffer::AlignedBuffer;
use std::time::Instant;

/// One target's place in a request's rotation
#[derive(Debug, Clone)]
pub struct RotationEntry {
    /// Index into the timespan's target list
    pub target_idx: usize,
    /// Consecutive dispatches this target receives per rotation cycle
    pub weight: u32,
    /// Dispatches left before moving to the next entry
    remaining: u32,
    /// Last offset issued from this slot against this target; only the
    /// parallel-async mode reads it
    pub prev_offset: u64,
}

/// State of one overlapped operation slot
pub struct IoRequest {
    slot: usize,
    rotation: Vec<RotationEntry>,
    position: usize,

    /// True between dispatch and completion
    pub in_flight: bool,
    /// Dispatch time, set only when latency measurement is on
    pub start_stamp: Option<Instant>,
    /// Rotation entry index the in-flight operation was issued against
    pub issued_entry: usize,
    /// Offset of the in-flight operation, for span reporting
    pub issued_offset: u64,
    /// Requested length of the in-flight operation
    pub issued_len: usize,

    read_buf: AlignedBuffer,
    /// Slot's window into the shared random write content
    write_src: *const u8,
}

// write_src points into the run-lifetime RandomContent buffer; the slot
// never outlives it and never writes through it.
unsafe impl Send for IoRequest {}

impl IoRequest {
    /// Build a slot rotating over `targets` as `(target_idx, weight)` pairs.
    /// Zero-weight entries must already be filtered out by the caller.
    pub fn new(
        slot: usize,
        targets: Vec<(usize, u32)>,
        buffer_size: usize,
        buffer_alignment: usize,
        write_src: *const u8,
    ) -> Self {
        debug_assert!(!targets.is_empty());
        debug_assert!(targets.iter().all(|&(_, w)| w > 0));
        let rotation = targets
            .into_iter()
            .map(|(target_idx, weight)| RotationEntry {
                target_idx,
                weight,
                remaining: weight,
                prev_offset: NO_PREVIOUS_OFFSET,
            })
            .collect();
        Self {
            slot,
            rotation,
            position: 0,
            in_flight: false,
            start_stamp: None,
            issued_entry: 0,
            issued_offset: 0,
            issued_len: 0,
            read_buf: AlignedBuffer::new(buffer_size, buffer_alignment),
            write_src,
        }
    }

    /// Backend token for this slot
    #[inline(always)]
    pub fn token(&self) -> u64 {
        self.slot as u64
    }

    /// Target the next dispatch goes to, without advancing the rotation
    #[inline(always)]
    pub fn peek_target(&self) -> usize {
        self.rotation[self.position].target_idx
    }

    /// Rotation entry index the next dispatch uses
    #[inline(always)]
    pub fn peek_entry(&self) -> usize {
        self.position
    }

    /// Consume one dispatch from the current entry and advance when its
    /// weight is spent
    pub fn advance_rotation(&mut self) {
        let entry = &mut self.rotation[self.position];
        entry.remaining -= 1;
        if entry.remaining == 0 {
            entry.remaining = entry.weight;
            self.position = (self.position + 1) % self.rotation.len();
        }
    }

    pub fn entry(&self, index: usize) -> &RotationEntry {
        &self.rotation[index]
    }

    pub fn entry_mut(&mut self, index: usize) -> &mut RotationEntry {
        &mut self.rotation[index]
    }

    /// Destination buffer for reads
    #[inline(always)]
    pub fn read_ptr(&mut self) -> *mut u8 {
        self.read_buf.as_mut_ptr()
    }

    /// Source buffer for writes
    #[inline(always)]
    pub fn write_ptr(&self) -> *const u8 {
        self.write_src
    }
}
