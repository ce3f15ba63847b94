//! The system heap underneath both allocator tiers.
//!
//! [`SystemHeap`] is the seam between the allocator and whatever actually
//! hands out memory. [`LibcHeap`] forwards to `malloc`/`free`/`realloc`;
//! [`FailingHeap`] wraps another heap, injects failures and records every call
//! so routing and OOM behavior can be observed.

#![allow(unsafe_code)]

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Source of raw memory for the allocator.
///
/// Returned regions must be aligned to at least 8 bytes.
pub trait SystemHeap {
    /// Requests `size` bytes. `None` means the heap is exhausted.
    fn allocate(&self, size: usize) -> Option<NonNull<u8>>;

    /// Returns a region to the heap.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate`/`reallocate` on this heap and must not
    /// be used afterwards. `size` is advisory.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize);

    /// Resizes a region, preserving `min(old_size, new_size)` bytes.
    ///
    /// On `None` the original region is untouched and still owned by the caller.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate`/`reallocate` on this heap with
    /// `old_size` bytes.
    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>>;
}

impl<H: SystemHeap + ?Sized> SystemHeap for &H {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        (**self).allocate(size)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        // SAFETY: forwarded caller contract.
        unsafe { (**self).deallocate(ptr, size) }
    }

    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: forwarded caller contract.
        unsafe { (**self).reallocate(ptr, old_size, new_size) }
    }
}

/// Host `malloc`/`free`/`realloc`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcHeap;

impl SystemHeap for LibcHeap {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        // SAFETY: malloc has no preconditions; a null result is handled.
        NonNull::new(unsafe { libc::malloc(size.max(1)) }.cast::<u8>())
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _size: usize) {
        // SAFETY: caller guarantees `ptr` came from malloc/realloc.
        unsafe { libc::free(ptr.as_ptr().cast::<libc::c_void>()) }
    }

    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        _old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        // SAFETY: caller guarantees `ptr` came from malloc/realloc. realloc
        // leaves the block untouched when it returns null.
        NonNull::new(
            unsafe { libc::realloc(ptr.as_ptr().cast::<libc::c_void>(), new_size.max(1)) }
                .cast::<u8>(),
        )
    }
}

/// One call observed by a [`FailingHeap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapCall {
    Allocate { size: usize, ok: bool },
    Deallocate { size: usize },
    Reallocate { old_size: usize, new_size: usize, ok: bool },
}

/// Instrumented heap that fails on demand.
///
/// `fail_next(k)` makes the next `k` allocate/reallocate calls fail;
/// `set_exhausted(true)` makes every such call fail until cleared.
pub struct FailingHeap<H = LibcHeap> {
    inner: H,
    pending_failures: AtomicUsize,
    exhausted: AtomicBool,
    calls: Mutex<Vec<HeapCall>>,
}

impl FailingHeap<LibcHeap> {
    /// Wraps the host heap.
    #[must_use]
    pub fn new() -> Self {
        Self::wrap(LibcHeap)
    }
}

impl Default for FailingHeap<LibcHeap> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: SystemHeap> FailingHeap<H> {
    #[must_use]
    pub fn wrap(inner: H) -> Self {
        Self {
            inner,
            pending_failures: AtomicUsize::new(0),
            exhausted: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next `k` allocate/reallocate calls.
    pub fn fail_next(&self, k: usize) {
        self.pending_failures.store(k, Ordering::SeqCst);
    }

    /// Fail every allocate/reallocate call while `exhausted` is set.
    pub fn set_exhausted(&self, exhausted: bool) {
        self.exhausted.store(exhausted, Ordering::SeqCst);
    }

    /// Snapshot of recorded calls.
    #[must_use]
    pub fn calls(&self) -> Vec<HeapCall> {
        self.calls.lock().clone()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Number of recorded allocate calls (failed ones included).
    #[must_use]
    pub fn allocate_calls(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, HeapCall::Allocate { .. }))
            .count()
    }

    /// Successful allocations minus deallocations.
    #[must_use]
    pub fn outstanding(&self) -> isize {
        self.calls.lock().iter().fold(0isize, |acc, call| match call {
            HeapCall::Allocate { ok: true, .. } => acc + 1,
            HeapCall::Deallocate { .. } => acc - 1,
            _ => acc,
        })
    }

    fn should_fail(&self) -> bool {
        if self.exhausted.load(Ordering::SeqCst) {
            return true;
        }
        self.pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn push(&self, call: HeapCall) {
        self.calls.lock().push(call);
    }
}

impl<H: SystemHeap> SystemHeap for FailingHeap<H> {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let result = if self.should_fail() {
            None
        } else {
            self.inner.allocate(size)
        };
        self.push(HeapCall::Allocate {
            size,
            ok: result.is_some(),
        });
        result
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
        self.push(HeapCall::Deallocate { size });
        // SAFETY: forwarded caller contract.
        unsafe { self.inner.deallocate(ptr, size) }
    }

    unsafe fn reallocate(
        &self,
        ptr: NonNull<u8>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        let result = if self.should_fail() {
            None
        } else {
            // SAFETY: forwarded caller contract.
            unsafe { self.inner.reallocate(ptr, old_size, new_size) }
        };
        self.push(HeapCall::Reallocate {
            old_size,
            new_size,
            ok: result.is_some(),
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn libc_heap_roundtrip() {
        let heap = LibcHeap;
        let ptr = heap.allocate(64).expect("malloc");
        assert_eq!(ptr.as_ptr() as usize % 8, 0);
        // SAFETY: ptr is valid for 64 bytes.
        unsafe {
            std::ptr::write_bytes(ptr.as_ptr(), 0x5A, 64);
            let grown = heap.reallocate(ptr, 64, 256).expect("realloc");
            assert_eq!(*grown.as_ptr().add(63), 0x5A);
            heap.deallocate(grown, 256);
        }
    }

    #[test]
    fn failing_heap_fails_exactly_k_times() {
        let heap = FailingHeap::new();
        heap.fail_next(2);
        assert!(heap.allocate(16).is_none());
        assert!(heap.allocate(16).is_none());
        let ptr = heap.allocate(16).expect("third call succeeds");
        // SAFETY: ptr came from this heap.
        unsafe { heap.deallocate(ptr, 16) };

        assert_eq!(
            heap.calls(),
            vec![
                HeapCall::Allocate { size: 16, ok: false },
                HeapCall::Allocate { size: 16, ok: false },
                HeapCall::Allocate { size: 16, ok: true },
                HeapCall::Deallocate { size: 16 },
            ]
        );
        assert_eq!(heap.outstanding(), 0);
    }

    #[test]
    fn exhausted_heap_fails_until_cleared() {
        let heap = FailingHeap::new();
        heap.set_exhausted(true);
        assert!(heap.allocate(8).is_none());
        assert!(heap.allocate(8).is_none());
        heap.set_exhausted(false);
        let ptr = heap.allocate(8).expect("recovered");
        // SAFETY: ptr came from this heap.
        unsafe { heap.deallocate(ptr, 8) };
        assert_eq!(heap.allocate_calls(), 3);
    }
}
