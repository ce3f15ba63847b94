//! `GlobalAlloc` adaptor.
//!
//! Layouts aligned to at most 8 bytes go through the normal two-tier paths.
//! Stricter alignments are over-allocated from the large tier and aligned by
//! hand; the raw pointer is stored in the word just before the aligned block.
//!
//! Unlike [`TierAllocator::reallocate`], `realloc` here always preserves
//! `min(old, new)` bytes, as `GlobalAlloc` requires.

#![allow(unsafe_code)]

use std::alloc::{GlobalAlloc, Layout};
use std::ptr::{self, NonNull};

use crate::TierAllocator;
use crate::size_class::{ALIGN, MAX_SMALL_BYTES};
use crate::system::SystemHeap;

const WORD: usize = size_of::<usize>();

impl<H: SystemHeap> TierAllocator<H> {
    fn alloc_overaligned(&self, layout: Layout) -> *mut u8 {
        let Some(total) = layout.size().checked_add(layout.align()) else {
            return ptr::null_mut();
        };
        // Routed through the large tier whatever the total, so `dealloc`
        // always knows where the raw block came from.
        let Ok(raw) = self.large_tier().allocate(total) else {
            return ptr::null_mut();
        };
        let raw_addr = raw.as_ptr() as usize;
        // `align > 8` and `raw` is 8-aligned, so at least one word sits
        // between `raw` and the aligned address.
        let offset = (raw_addr + 1).next_multiple_of(layout.align()) - raw_addr;
        // SAFETY: `offset <= align`, leaving `size` bytes after the aligned
        // address inside `total`; the header word lies in `[raw, aligned)`.
        unsafe {
            let aligned = raw.as_ptr().add(offset);
            aligned.sub(WORD).cast::<usize>().write_unaligned(raw_addr);
            aligned
        }
    }

    /// # Safety
    ///
    /// `ptr` must come from `alloc_overaligned` with `layout`.
    unsafe fn dealloc_overaligned(&self, ptr: *mut u8, layout: Layout) {
        // SAFETY: the header word was written by `alloc_overaligned`.
        let raw_addr = unsafe { ptr.sub(WORD).cast::<usize>().read_unaligned() };
        if let Some(raw) = NonNull::new(raw_addr as *mut u8) {
            // SAFETY: `raw` is the large block of `size + align` bytes.
            unsafe {
                self.large_tier()
                    .deallocate(raw, layout.size() + layout.align())
            };
        }
    }
}

// SAFETY: every pointer handed out is valid for `layout.size()` bytes with the
// requested alignment until passed back, and blocks are never shared between
// live allocations.
unsafe impl<H: SystemHeap + Sync> GlobalAlloc for TierAllocator<H> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGN {
            return self.alloc_overaligned(layout);
        }
        self.allocate(layout.size().max(1))
            .unwrap_or(ptr::null_mut())
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGN {
            let ptr = self.alloc_overaligned(layout);
            if !ptr.is_null() {
                // SAFETY: fresh block of `layout.size()` bytes.
                unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
            }
            return ptr;
        }
        self.allocate_zeroed(layout.size().max(1))
            .unwrap_or(ptr::null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.align() > ALIGN {
            // SAFETY: forwarded `GlobalAlloc` contract.
            unsafe { self.dealloc_overaligned(ptr, layout) };
            return;
        }
        // SAFETY: forwarded `GlobalAlloc` contract; the size maps to the
        // class the block was allocated from.
        unsafe { self.deallocate(ptr, layout.size().max(1)) };
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let old_size = layout.size().max(1);
        let new_size = new_size.max(1);
        if layout.align() <= ALIGN && old_size > MAX_SMALL_BYTES && new_size > MAX_SMALL_BYTES {
            // SAFETY: forwarded `GlobalAlloc` contract; both sizes stay in the
            // large tier, which preserves content and keeps `ptr` on failure.
            return unsafe { self.reallocate(ptr, old_size, new_size) }
                .unwrap_or(ptr::null_mut());
        }

        // SAFETY: `new_size` is non-zero and `layout.align()` is already valid.
        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
        // SAFETY: forwarded `GlobalAlloc` contract.
        let new_ptr = unsafe { self.alloc(new_layout) };
        if !new_ptr.is_null() {
            // SAFETY: both blocks are live and distinct, each valid for at
            // least the copied length.
            unsafe {
                ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
                self.dealloc(ptr, layout);
            }
        }
        new_ptr
    }
}
