//! Typed array adaptor over a [`TierAllocator`].

#![allow(unsafe_code)]

use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::TierAllocator;
use crate::error::AllocError;
use crate::size_class::ALIGN;
use crate::system::{LibcHeap, SystemHeap};

/// Allocates arrays of `T` by forwarding byte counts to the allocator.
pub struct TypedAlloc<'a, T, H: SystemHeap = LibcHeap> {
    alloc: &'a TierAllocator<H>,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T, H: SystemHeap> TypedAlloc<'a, T, H> {
    pub fn new(alloc: &'a TierAllocator<H>) -> Self {
        Self {
            alloc,
            _marker: PhantomData,
        }
    }

    fn byte_len(n: usize) -> Result<usize, AllocError> {
        if align_of::<T>() > ALIGN {
            return Err(AllocError::UnsupportedAlignment {
                align: align_of::<T>(),
            });
        }
        n.checked_mul(size_of::<T>())
            .ok_or(AllocError::CapacityOverflow)
    }

    /// Uninitialized storage for `n` values of `T`.
    ///
    /// A zero-byte request returns a dangling, well-aligned pointer.
    pub fn allocate(&self, n: usize) -> Result<NonNull<T>, AllocError> {
        let bytes = Self::byte_len(n)?;
        if bytes == 0 {
            return Ok(NonNull::dangling());
        }
        let ptr = self.alloc.allocate(bytes)?;
        NonNull::new(ptr.cast::<T>()).ok_or(AllocError::OutOfMemory { requested: bytes })
    }

    /// Returns storage obtained from [`allocate`](Self::allocate).
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate(n)` on an adaptor over the same
    /// allocator, with the same `n`, and must not be used afterwards. Any
    /// values still stored are not dropped.
    pub unsafe fn deallocate(&self, ptr: NonNull<T>, n: usize) {
        let Ok(bytes) = Self::byte_len(n) else {
            return;
        };
        // SAFETY: forwarded caller contract; zero bytes is a no-op.
        unsafe { self.alloc.deallocate(ptr.as_ptr().cast(), bytes) };
    }
}

impl<T, H: SystemHeap> Clone for TypedAlloc<'_, T, H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T, H: SystemHeap> Copy for TypedAlloc<'_, T, H> {}
