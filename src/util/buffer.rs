//! Aligned buffer management
//!
//! O_DIRECT requires IO buffers aligned to the device block size (512 or
//! 4096 bytes). Every read request owns one aligned buffer; writes source
//! their payload from one shared random-content buffer per run so worker
//! threads never generate data in the hot path.

use std::alloc::{alloc, dealloc, Layout};

/// Memory-aligned buffer suitable for O_DIRECT operations
pub struct AlignedBuffer {
    ptr: *mut u8,
    size: usize,
    layout: Layout,
}

impl AlignedBuffer {
    /// Allocate a zeroed buffer of `size` bytes aligned to `alignment`.
    ///
    /// # Panics
    ///
    /// Panics if `alignment` is not a power of two, `size` is zero, or the
    /// allocation fails. Buffer sizing happens during setup where a failed
    /// allocation aborts the run anyway.
    pub fn new(size: usize, alignment: usize) -> Self {
        assert!(alignment.is_power_of_two(), "alignment must be a power of 2");
        assert!(size > 0, "buffer size must be non-zero");

        let layout = Layout::from_size_align(size, alignment).expect("invalid buffer layout");
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            panic!("failed to allocate {} byte aligned buffer", size);
        }
        unsafe { std::ptr::write_bytes(ptr, 0, size) };

        Self { ptr, size, layout }
    }

    #[inline(always)]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    #[inline(always)]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    #[inline(always)]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }

    #[inline(always)]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Fill with a deterministic pseudo-random byte stream
    pub fn fill_random(&mut self, seed: u64) {
        let mut state = seed | 1;
        for byte in self.as_mut_slice() {
            state = state.wrapping_mul(1103515245).wrapping_add(12345);
            *byte = (state >> 16) as u8;
        }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

// AlignedBuffer owns its memory.
unsafe impl Send for AlignedBuffer {}

/// Shared random write-content buffer
///
/// Filled once during setup and read-only afterwards. Write requests carry
/// disjoint aligned views into it instead of generating payload bytes per
/// dispatch.
pub struct RandomContent {
    buffer: AlignedBuffer,
}

impl RandomContent {
    /// Size the buffer so that `slots` requests of `block` bytes each get a
    /// distinct aligned window.
    pub fn new(block: usize, slots: usize, alignment: usize, seed: u64) -> Self {
        let mut buffer = AlignedBuffer::new(block * slots.max(1), alignment);
        buffer.fill_random(seed);
        Self { buffer }
    }

    /// Read-only view for request-slot `slot`
    ///
    /// # Panics
    ///
    /// Panics if the slot window exceeds the buffer (a setup bug).
    pub fn slot_ptr(&self, slot: usize, block: usize) -> *const u8 {
        let offset = slot * block;
        assert!(offset + block <= self.buffer.size());
        unsafe { self.buffer.as_ptr().add(offset) }
    }
}

// Read-only after construction; views handed out are never written through.
unsafe impl Sync for RandomContent {}
unsafe impl Send for RandomContent {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment() {
        for align in [512usize, 4096] {
            let buf = AlignedBuffer::new(8192, align);
            assert_eq!(buf.as_ptr() as usize % align, 0);
            assert_eq!(buf.size(), 8192);
        }
    }

    #[test]
    fn test_zeroed_on_alloc() {
        let buf = AlignedBuffer::new(4096, 512);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_fill_random_deterministic() {
        let mut a = AlignedBuffer::new(1024, 512);
        let mut b = AlignedBuffer::new(1024, 512);
        a.fill_random(7);
        b.fill_random(7);
        assert_eq!(a.as_slice(), b.as_slice());
        assert!(a.as_slice().iter().any(|&x| x != 0));
    }

    #[test]
    fn test_random_content_slots_are_disjoint() {
        let content = RandomContent::new(512, 4, 512, 3);
        let p0 = content.slot_ptr(0, 512) as usize;
        let p3 = content.slot_ptr(3, 512) as usize;
        assert_eq!(p3 - p0, 3 * 512);
    }

    #[test]
    #[should_panic]
    fn test_random_content_out_of_range_slot() {
        let content = RandomContent::new(512, 2, 512, 3);
        let _ = content.slot_ptr(2, 512);
    }
}
