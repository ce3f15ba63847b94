//! Large-block allocation (> 128 bytes).
//!
//! Requests above the largest size class go straight to the system heap. When
//! the heap fails, the OOM retry loop runs: without a registered handler the
//! request fails with [`AllocError::OutOfMemory`]; with one, the handler is
//! invoked (it is expected to release memory elsewhere) and the request is
//! retried. The loop is unbounded unless `oom_retry_limit` is configured, so a
//! handler that can never free anything spins forever.

#![allow(unsafe_code)]

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::AllocError;
use crate::system::SystemHeap;

/// Callback run when the system heap is exhausted.
pub type OomHandler = Arc<dyn Fn() + Send + Sync>;

/// Delegating allocator with the OOM handler slot and retry loop.
pub struct LargeAllocator<H> {
    heap: H,
    oom_handler: Mutex<Option<OomHandler>>,
    oom_retry_limit: Option<u32>,
    allocations: AtomicU64,
    oom_handler_invocations: AtomicU64,
}

impl<H: SystemHeap> LargeAllocator<H> {
    /// Creates a large allocator with an empty handler slot.
    pub const fn new(heap: H, oom_retry_limit: Option<u32>) -> Self {
        Self {
            heap,
            oom_handler: parking_lot::const_mutex(None),
            oom_retry_limit,
            allocations: AtomicU64::new(0),
            oom_handler_invocations: AtomicU64::new(0),
        }
    }

    /// The underlying system heap.
    pub fn heap(&self) -> &H {
        &self.heap
    }

    /// Allocates `size` bytes from the system heap, running the OOM loop on failure.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let ptr = self.allocate_for_pool(size)?;
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(ptr)
    }

    /// Same as [`allocate`](Self::allocate) without counting the block as a
    /// large allocation. Used for pool chunks obtained through the OOM loop.
    pub(crate) fn allocate_for_pool(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        match self.heap.allocate(size) {
            Some(ptr) => Ok(ptr),
            None => self.retry_after_oom(size, || self.heap.allocate(size)),
        }
    }

    /// Returns a region to the system heap. `size` is not validated.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`allocate`](Self::allocate) or
    /// [`reallocate`](Self::reallocate) on this allocator and must not be used
    /// afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: forwarded caller contract.
        unsafe { self.heap.deallocate(ptr, size) }
    }

    /// Resizes a region through the system heap, preserving
    /// `min(old_size, new_size)` bytes. Runs the OOM loop on failure.
    ///
    /// On error the original region is still valid and owned by the caller.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this allocator with `old_size` bytes.
    pub unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: forwarded caller contract; a failed realloc leaves `ptr` intact,
        // so retrying with the same pointer is sound.
        let attempt = || unsafe { self.heap.reallocate(ptr, old_size, new_size) };
        match attempt() {
            Some(ptr) => Ok(ptr),
            None => self.retry_after_oom(new_size, attempt),
        }
    }

    /// Replaces the OOM handler, returning the previous one.
    pub fn set_oom_handler(&self, handler: Option<OomHandler>) -> Option<OomHandler> {
        std::mem::replace(&mut *self.oom_handler.lock(), handler)
    }

    /// Currently registered OOM handler.
    pub fn oom_handler(&self) -> Option<OomHandler> {
        self.oom_handler.lock().clone()
    }

    /// Successful caller-visible large allocations. Pool chunks obtained
    /// through the OOM loop are not included.
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Times an OOM handler has been invoked.
    pub fn oom_handler_invocations(&self) -> u64 {
        self.oom_handler_invocations.load(Ordering::Relaxed)
    }

    /// The OOM retry loop shared by allocate and reallocate.
    ///
    /// The handler is cloned out of its slot before each call so it may
    /// itself replace the handler.
    fn retry_after_oom(
        &self,
        requested: usize,
        mut attempt: impl FnMut() -> Option<NonNull<u8>>,
    ) -> Result<NonNull<u8>, AllocError> {
        let mut rounds: u32 = 0;
        loop {
            let Some(handler) = self.oom_handler() else {
                return Err(AllocError::OutOfMemory { requested });
            };
            if self.oom_retry_limit.is_some_and(|limit| rounds >= limit) {
                return Err(AllocError::OutOfMemory { requested });
            }
            rounds = rounds.saturating_add(1);
            self.oom_handler_invocations.fetch_add(1, Ordering::Relaxed);
            handler();
            if let Some(ptr) = attempt() {
                return Ok(ptr);
            }
        }
    }
}

impl<H> fmt::Debug for LargeAllocator<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LargeAllocator")
            .field("has_oom_handler", &self.oom_handler.lock().is_some())
            .field("oom_retry_limit", &self.oom_retry_limit)
            .field("allocations", &self.allocations.load(Ordering::Relaxed))
            .field(
                "oom_handler_invocations",
                &self.oom_handler_invocations.load(Ordering::Relaxed),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::{FailingHeap, HeapCall};
    use std::sync::atomic::AtomicUsize;

    fn counting_handler() -> (OomHandler, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let handler: OomHandler = Arc::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        (handler, count)
    }

    #[test]
    fn test_allocate_and_free() {
        let large = LargeAllocator::new(FailingHeap::new(), None);
        let ptr = large.allocate(4096).unwrap();
        // SAFETY: ptr is valid for 4096 bytes and released once.
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0xAB, 4096);
            large.deallocate(ptr, 4096);
        }
        assert_eq!(large.allocations(), 1);
        assert_eq!(large.heap().outstanding(), 0);
    }

    #[test]
    fn test_pool_allocation_is_not_counted() {
        let large = LargeAllocator::new(FailingHeap::new(), None);
        let (handler, count) = counting_handler();
        large.set_oom_handler(Some(handler));
        large.heap().fail_next(1);
        let ptr = large.allocate_for_pool(336).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(large.allocations(), 0);
        // SAFETY: ptr came from this allocator.
        unsafe { large.deallocate(ptr, 336) };
    }

    #[test]
    fn test_no_handler_fails_immediately() {
        let large = LargeAllocator::new(FailingHeap::new(), None);
        large.heap().fail_next(1);
        assert_eq!(
            large.allocate(1000).unwrap_err(),
            AllocError::OutOfMemory { requested: 1000 }
        );
        assert_eq!(large.heap().allocate_calls(), 1);
        assert_eq!(large.oom_handler_invocations(), 0);
    }

    #[test]
    fn test_handler_invoked_once_per_failure() {
        let large = LargeAllocator::new(FailingHeap::new(), None);
        let (handler, count) = counting_handler();
        assert!(large.set_oom_handler(Some(handler)).is_none());

        large.heap().fail_next(3);
        let ptr = large.allocate(512).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert_eq!(large.heap().allocate_calls(), 4);
        assert_eq!(large.oom_handler_invocations(), 3);
        // SAFETY: ptr came from this allocator.
        unsafe { large.deallocate(ptr, 512) };
    }

    #[test]
    fn test_set_handler_returns_previous() {
        let large = LargeAllocator::new(FailingHeap::new(), None);
        let (first, _) = counting_handler();
        let (second, _) = counting_handler();
        assert!(large.set_oom_handler(Some(Arc::clone(&first))).is_none());
        let previous = large.set_oom_handler(Some(second)).unwrap();
        assert!(Arc::ptr_eq(&previous, &first));
        assert!(large.set_oom_handler(None).is_some());
        assert!(large.oom_handler().is_none());
    }

    #[test]
    fn test_retry_limit_bounds_the_loop() {
        let large = LargeAllocator::new(FailingHeap::new(), Some(4));
        let (handler, count) = counting_handler();
        large.set_oom_handler(Some(handler));
        large.heap().set_exhausted(true);

        assert!(large.allocate(300).unwrap_err().is_out_of_memory());
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_handler_clearing_itself_ends_loop() {
        let large = Arc::new(LargeAllocator::new(FailingHeap::new(), None));
        let weak = Arc::downgrade(&large);
        large.set_oom_handler(Some(Arc::new(move || {
            if let Some(large) = weak.upgrade() {
                large.set_oom_handler(None);
            }
        })));
        large.heap().set_exhausted(true);

        assert!(large.allocate(300).unwrap_err().is_out_of_memory());
        assert_eq!(large.oom_handler_invocations(), 1);
    }

    #[test]
    fn test_realloc_preserves_content_and_retries() {
        let large = LargeAllocator::new(FailingHeap::new(), None);
        let (handler, count) = counting_handler();
        large.set_oom_handler(Some(handler));

        let ptr = large.allocate(200).unwrap();
        // SAFETY: ptr is valid for 200 bytes; realloc keeps the prefix.
        unsafe {
            for i in 0..200 {
                *ptr.as_ptr().add(i) = i as u8;
            }
            large.heap().fail_next(1);
            let grown = large.reallocate(ptr, 200, 300).unwrap();
            for i in 0..200 {
                assert_eq!(*grown.as_ptr().add(i), i as u8);
            }
            large.deallocate(grown, 300);
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(large.heap().calls().contains(&HeapCall::Reallocate {
            old_size: 200,
            new_size: 300,
            ok: true
        }));
    }
}
