//! The memory pool backing the small-block tier.
//!
//! A single active range `[start, end)` is consumed by bump allocation. When
//! it cannot supply even one block, the allocator grows it: any leftover
//! fragment is donated to the free list of its exact size, and a new chunk is
//! installed. Chunks are never returned to the system while the allocator
//! lives; each one carries a small header linking it into a registry so they
//! can all be released when the allocator is dropped.
//!
//! The registry lives inside the chunks themselves: the pool must not
//! allocate from the global heap, because it may *be* the global heap.

#![allow(unsafe_code)]

use std::ptr::{self, NonNull};

use crate::size_class::round_up;
use crate::system::SystemHeap;

/// Bytes reserved at the front of every system chunk for the registry link.
/// Keeps the usable part 16-byte aligned.
pub const CHUNK_HEADER: usize = 16;

#[repr(C)]
struct ChunkHeader {
    next: *mut ChunkHeader,
    usable: usize,
}

/// Bump-allocated arena plus growth accounting.
pub(crate) struct MemoryPool {
    start: *mut u8,
    end: *mut u8,
    /// Total usable bytes ever acquired from the system for the pool.
    heap_size: usize,
    chunks: *mut ChunkHeader,
    chunk_count: usize,
}

// SAFETY: the pool exclusively owns the chunks it points into and is only
// reached through the allocator's mutex.
unsafe impl Send for MemoryPool {}

impl MemoryPool {
    pub(crate) const fn new() -> Self {
        Self {
            start: ptr::null_mut(),
            end: ptr::null_mut(),
            heap_size: 0,
            chunks: ptr::null_mut(),
            chunk_count: 0,
        }
    }

    /// Bytes left in the active range.
    pub(crate) fn remaining(&self) -> usize {
        self.end as usize - self.start as usize
    }

    pub(crate) fn heap_size(&self) -> usize {
        self.heap_size
    }

    pub(crate) fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// Bump-allocates `*count` blocks of `size` bytes.
    ///
    /// Serves the whole batch when the range holds it; otherwise reduces
    /// `*count` to as many whole blocks as fit. Returns `None` (with `*count`
    /// untouched) when not even one block fits.
    pub(crate) fn carve(&mut self, size: usize, count: &mut usize) -> Option<NonNull<u8>> {
        let left = self.remaining();
        if left < size || size == 0 {
            return None;
        }
        let wanted = size.saturating_mul(*count);
        if left < wanted {
            *count = left / size;
        }
        let taken = size * *count;
        let result = NonNull::new(self.start)?;
        // SAFETY: `taken <= left`, so the cursor stays within `[start, end]`.
        self.start = unsafe { self.start.add(taken) };
        Some(result)
    }

    /// Bytes to request when growing for a batch of `total` bytes:
    /// twice the batch plus a sixteenth of everything acquired so far.
    pub(crate) fn growth_target(&self, total: usize) -> Option<usize> {
        total
            .checked_mul(2)?
            .checked_add(round_up(self.heap_size >> 4))
    }

    /// Removes and returns the leftover range, if any, leaving the pool empty.
    pub(crate) fn take_fragment(&mut self) -> Option<(NonNull<u8>, usize)> {
        let left = self.remaining();
        let start = NonNull::new(self.start);
        self.clear();
        match start {
            Some(start) if left > 0 => Some((start, left)),
            _ => None,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.start = ptr::null_mut();
        self.end = ptr::null_mut();
    }

    /// Installs a freshly acquired system chunk of `CHUNK_HEADER + usable`
    /// bytes as the active range and registers it for release.
    ///
    /// # Safety
    ///
    /// `raw` must be an exclusively owned, 8-byte aligned allocation of at
    /// least `CHUNK_HEADER + usable` bytes from the heap later passed to
    /// [`release_chunks`](Self::release_chunks).
    pub(crate) unsafe fn install_chunk(&mut self, raw: NonNull<u8>, usable: usize) {
        let header = raw.as_ptr().cast::<ChunkHeader>();
        // SAFETY: caller guarantees the header fits at the front of `raw`.
        unsafe {
            header.write(ChunkHeader {
                next: self.chunks,
                usable,
            });
            self.start = raw.as_ptr().add(CHUNK_HEADER);
            self.end = self.start.add(usable);
        }
        self.chunks = header;
        self.chunk_count += 1;
        self.heap_size += usable;
    }

    /// Uses a block detached from a free list as the active range. The block
    /// already belongs to a registered chunk, so nothing is registered.
    ///
    /// # Safety
    ///
    /// `block` must be exclusively owned and valid for `len` bytes.
    pub(crate) unsafe fn install_borrowed(&mut self, block: NonNull<u8>, len: usize) {
        self.start = block.as_ptr();
        // SAFETY: caller guarantees `len` bytes from `block`.
        self.end = unsafe { self.start.add(len) };
    }

    /// Returns every registered chunk to `heap` and empties the pool.
    ///
    /// # Safety
    ///
    /// No block carved from any chunk may be used afterwards, and `heap` must
    /// be the heap the chunks came from.
    pub(crate) unsafe fn release_chunks<H: SystemHeap>(&mut self, heap: &H) {
        let mut cursor = self.chunks;
        while let Some(header) = NonNull::new(cursor) {
            // SAFETY: every registered header was written by `install_chunk`.
            let ChunkHeader { next, usable } = unsafe { header.as_ptr().read() };
            // SAFETY: the chunk came from `heap` with this total size.
            unsafe { heap.deallocate(header.cast(), CHUNK_HEADER + usable) };
            cursor = next;
        }
        self.chunks = ptr::null_mut();
        self.chunk_count = 0;
        self.clear();
    }
}
