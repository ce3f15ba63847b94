//! Integration test: allocator-level properties.
//!
//! Exercises the public `TierAllocator` API end to end: LIFO reuse, size-class
//! routing, refill contiguity, fragment reuse, cannibalization, OOM
//! escalation, teardown and concurrent churn.
//!
//! Run: cargo test -p tieralloc-core --test allocator_properties_test

#![allow(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use tieralloc_core::size_class::{MAX_SMALL_BYTES, class_index};
use tieralloc_core::{
    AllocError, AllocatorConfig, CHUNK_HEADER, FailingHeap, HeapCall, OomHandler, TierAllocator,
};

fn fresh(heap: &FailingHeap) -> TierAllocator<&FailingHeap> {
    TierAllocator::with_heap(heap, AllocatorConfig::DEFAULT)
}

fn counting_handler() -> (OomHandler, Arc<AtomicUsize>) {
    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    let handler: OomHandler = Arc::new(move || {
        seen.fetch_add(1, Ordering::SeqCst);
    });
    (handler, count)
}

#[test]
fn lifo_reuse_for_every_small_size() {
    let heap = FailingHeap::new();
    let alloc = fresh(&heap);
    for n in 1..=MAX_SMALL_BYTES {
        let p = alloc.allocate(n).unwrap();
        // SAFETY: p is a live block of n bytes.
        unsafe { alloc.deallocate(p, n) };
        assert_eq!(alloc.allocate(n).unwrap(), p, "size {n}");
    }
}

#[test]
fn class_mapping_is_exact() {
    for n in 1..=MAX_SMALL_BYTES {
        assert_eq!(class_index(n), Some((n + 7) / 8 - 1));
    }
    assert_eq!(class_index(0), None);
    assert_eq!(class_index(129), None);

    let heap = FailingHeap::new();
    let alloc = fresh(&heap);
    let p = alloc.allocate(129).unwrap();
    // SAFETY: live large block.
    unsafe { alloc.deallocate(p, 129) };
    assert_eq!(alloc.stats().total_free_blocks(), 0);
}

#[test]
fn refilled_class_zero_blocks_are_contiguous() {
    let heap = FailingHeap::new();
    let alloc = fresh(&heap);
    let first = alloc.allocate(8).unwrap() as usize;
    let mut prev = first;
    for _ in 0..19 {
        let next = alloc.allocate(8).unwrap() as usize;
        assert_eq!(next - prev, 8);
        prev = next;
    }
    assert_eq!(heap.allocate_calls(), 1);
}

#[test]
fn routing_by_size() {
    let heap = FailingHeap::new();
    let alloc = fresh(&heap);

    let big = alloc.allocate(200).unwrap();
    assert_eq!(heap.calls(), vec![HeapCall::Allocate { size: 200, ok: true }]);

    heap.clear_calls();
    let small = alloc.allocate(64).unwrap();
    // The only system call is the pool growth for a batch of 20.
    assert_eq!(
        heap.calls(),
        vec![HeapCall::Allocate {
            size: 2 * 20 * 64 + CHUNK_HEADER,
            ok: true
        }]
    );

    heap.clear_calls();
    // SAFETY: both blocks are live with their original sizes.
    unsafe {
        alloc.deallocate(small, 64);
        alloc.deallocate(big, 200);
    }
    assert_eq!(heap.calls(), vec![HeapCall::Deallocate { size: 200 }]);
}

#[test]
fn handler_runs_once_per_failure() {
    for k in 1..=5 {
        let heap = FailingHeap::new();
        let alloc = fresh(&heap);
        let (handler, count) = counting_handler();
        alloc.set_oom_handler(Some(handler));
        heap.fail_next(k);
        let p = alloc.allocate(1000).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), k);
        // SAFETY: live large block.
        unsafe { alloc.deallocate(p, 1000) };
    }
}

#[test]
fn no_handler_fails_immediately() {
    let heap = FailingHeap::new();
    let alloc = fresh(&heap);
    heap.fail_next(1);
    assert_eq!(
        alloc.allocate(1000),
        Err(AllocError::OutOfMemory { requested: 1000 })
    );
    assert_eq!(heap.allocate_calls(), 1);
}

#[test]
fn zero_size_operations_are_no_ops() {
    let heap = FailingHeap::new();
    let alloc = fresh(&heap);
    assert!(alloc.allocate(0).unwrap().is_null());
    // SAFETY: zero-size frees never touch the pointer.
    unsafe {
        alloc.deallocate(std::ptr::null_mut(), 0);
        alloc.deallocate(0xdead_beef as *mut u8, 0);
    }
    assert!(heap.calls().is_empty());
}

#[test]
fn growth_remainder_serves_its_class_without_new_growth() {
    let heap = FailingHeap::new();
    let alloc = fresh(&heap);
    alloc.allocate(8).unwrap();
    alloc.allocate(128).unwrap();
    let remainder = alloc.stats().pool_remaining;
    assert_eq!(remainder, 32);

    alloc.allocate(120).unwrap();
    let growths = alloc.stats().pool_growths;
    heap.clear_calls();

    alloc.allocate(remainder).unwrap();
    assert!(heap.calls().is_empty());
    assert_eq!(alloc.stats().pool_growths, growths);
}

#[test]
fn failing_heap_cannibalizes_before_escalating() {
    let heap = FailingHeap::new();
    let alloc = TierAllocator::with_heap(&heap, AllocatorConfig::DEFAULT.with_refill_batch(1));
    alloc.allocate(96).unwrap();
    let donor = alloc.allocate(96).unwrap();
    assert_eq!(alloc.stats().pool_remaining, 0);
    // SAFETY: live block of class 11.
    unsafe { alloc.deallocate(donor, 96) };

    heap.set_exhausted(true);
    let p = alloc.allocate(24).unwrap();
    assert_eq!(p, donor);
    let stats = alloc.stats();
    assert_eq!(stats.cannibalized, 1);
    assert_eq!(stats.oom_escalations, 0);
    assert_eq!(stats.pool_remaining, 72);
}

#[test]
fn escalation_without_handler_is_out_of_memory() {
    let heap = FailingHeap::new();
    let alloc = fresh(&heap);
    heap.set_exhausted(true);
    assert!(alloc.allocate(48).unwrap_err().is_out_of_memory());
    assert_eq!(alloc.stats().oom_escalations, 1);
    assert_eq!(alloc.stats().large_allocations, 0);
}

#[test]
fn escalation_recovers_when_handler_frees_memory() {
    let heap = FailingHeap::new();
    let alloc = fresh(&heap);
    let (handler, count) = counting_handler();
    alloc.set_oom_handler(Some(handler));
    heap.fail_next(3);
    assert!(!alloc.allocate(48).unwrap().is_null());
    assert_eq!(count.load(Ordering::SeqCst), 2);
    let stats = alloc.stats();
    assert_eq!(stats.oom_escalations, 1);
    assert_eq!(stats.pool_growths, 1);
    // The escalated chunk belongs to the pool, not to the caller.
    assert_eq!(stats.large_allocations, 0);
}

#[test]
fn drop_releases_every_chunk() {
    let heap = FailingHeap::new();
    {
        let alloc = fresh(&heap);
        let mut live = Vec::new();
        for n in (1..=128).step_by(7) {
            live.push((alloc.allocate(n).unwrap(), n));
        }
        for (p, n) in live.drain(..).step_by(2) {
            // SAFETY: live block with its original size.
            unsafe { alloc.deallocate(p, n) };
        }
        assert!(alloc.stats().pool_chunks > 0);
    }
    assert_eq!(heap.outstanding(), 0);
}

#[test]
fn concurrent_churn_hands_out_disjoint_blocks() {
    let alloc = Arc::new(TierAllocator::new());
    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            let alloc = Arc::clone(&alloc);
            thread::spawn(move || {
                let mut state = 0x9E37_79B9_7F4A_7C15u64 ^ (t + 1);
                let mut live: Vec<(usize, usize)> = Vec::new();
                for _ in 0..2000 {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    let size = (state % 300) as usize + 1;
                    if state & 1 == 0 || live.is_empty() {
                        let p = alloc.allocate(size).unwrap();
                        // SAFETY: p is valid for `size` bytes.
                        unsafe { std::ptr::write_bytes(p, t as u8, size) };
                        live.push((p as usize, size));
                    } else {
                        let (p, n) = live.swap_remove((state as usize >> 8) % live.len());
                        // SAFETY: p was written only by this thread.
                        let bytes = unsafe { std::slice::from_raw_parts(p as *const u8, n) };
                        assert!(bytes.iter().all(|&b| b == t as u8));
                        // SAFETY: live block with its original size.
                        unsafe { alloc.deallocate(p as *mut u8, n) };
                    }
                }
                live
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }
    let unique: HashSet<usize> = all.iter().map(|&(p, _)| p).collect();
    assert_eq!(unique.len(), all.len());
    for (p, n) in all {
        // SAFETY: every remaining block is live.
        unsafe { alloc.deallocate(p as *mut u8, n) };
    }
}
