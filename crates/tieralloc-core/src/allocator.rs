//! Two-tier allocator state.
//!
//! [`TierAllocator`] routes every request by size. Requests above 128 bytes
//! go to the [`LargeAllocator`]; everything else is served from the
//! size-class free lists, refilled in batches from the memory pool. The free
//! lists, pool bounds, counters and lifecycle records sit behind a single
//! allocator-wide lock; pool growth (fragment donation, cannibalization and
//! chunk installation) happens inside that critical section. The large tier
//! only takes it to log a failed request.

#![allow(unsafe_code)]

use std::fmt;
use std::ptr::{self, NonNull};

use parking_lot::{Mutex, MutexGuard};

use crate::config::AllocatorConfig;
use crate::error::AllocError;
use crate::free_list::FreeListBank;
use crate::large::{LargeAllocator, OomHandler};
use crate::log::{AllocatorLogLevel, AllocatorLogRecord, LifecycleLog, LogEvent};
use crate::pool::{CHUNK_HEADER, MemoryPool};
use crate::size_class::{self, ALIGN, NUM_SIZE_CLASSES};
use crate::stats::{AllocatorStats, SmallCounters};
use crate::system::{LibcHeap, SystemHeap};

/// Everything guarded by the small-tier lock.
struct SmallHeap {
    bank: FreeListBank,
    pool: MemoryPool,
    counters: SmallCounters,
    log: LifecycleLog,
}

impl SmallHeap {
    const fn new(config: &AllocatorConfig) -> Self {
        Self {
            bank: FreeListBank::new(),
            pool: MemoryPool::new(),
            counters: SmallCounters::new(),
            log: LifecycleLog::new(config.log_level, config.log_capacity),
        }
    }

    fn record(&mut self, event: LogEvent, details: impl FnOnce() -> String) {
        let heap_size = self.pool.heap_size();
        let remaining = self.pool.remaining();
        self.log.record(event, heap_size, remaining, details);
    }
}

/// Two-tier general-purpose allocator.
///
/// The four core operations are [`allocate`](Self::allocate),
/// [`deallocate`](Self::deallocate), [`reallocate`](Self::reallocate) and
/// [`set_oom_handler`](Self::set_oom_handler). Instances are independent;
/// nothing is shared between two allocators.
pub struct TierAllocator<H: SystemHeap = LibcHeap> {
    large: LargeAllocator<H>,
    small: Mutex<SmallHeap>,
    config: AllocatorConfig,
}

impl TierAllocator<LibcHeap> {
    /// Allocator over the host heap with default configuration.
    ///
    /// Usable in a `static`, e.g. behind `#[global_allocator]`.
    pub const fn new() -> Self {
        Self::with_heap(LibcHeap, AllocatorConfig::DEFAULT)
    }

    /// Allocator over the host heap configured from `TIERALLOC_MODE` / `TIERALLOC_LOG`.
    pub fn from_env() -> Self {
        Self::with_heap(LibcHeap, AllocatorConfig::from_env())
    }
}

impl Default for TierAllocator<LibcHeap> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: SystemHeap> TierAllocator<H> {
    /// Allocator over `heap` with `config`.
    pub const fn with_heap(heap: H, config: AllocatorConfig) -> Self {
        Self {
            large: LargeAllocator::new(heap, config.oom_retry_limit),
            small: parking_lot::const_mutex(SmallHeap::new(&config)),
            config,
        }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// The underlying system heap.
    pub fn heap(&self) -> &H {
        self.large.heap()
    }

    pub(crate) fn large_tier(&self) -> &LargeAllocator<H> {
        &self.large
    }

    /// Allocates `size` bytes.
    ///
    /// A zero-byte request returns null without touching the system heap.
    /// Small blocks are 8-byte aligned; large blocks carry the system heap's
    /// alignment.
    pub fn allocate(&self, size: usize) -> Result<*mut u8, AllocError> {
        if size == 0 {
            return Ok(ptr::null_mut());
        }
        let block = match size_class::class_index(size) {
            Some(class) => self.allocate_small(class)?,
            None => self.allocate_large(size)?,
        };
        Ok(block.as_ptr())
    }

    /// Allocates `size` zeroed bytes.
    pub fn allocate_zeroed(&self, size: usize) -> Result<*mut u8, AllocError> {
        let ptr = self.allocate(size)?;
        if !ptr.is_null() {
            // SAFETY: `ptr` was just allocated with at least `size` bytes.
            unsafe { ptr::write_bytes(ptr, 0, size) };
        }
        Ok(ptr)
    }

    /// Returns a block.
    ///
    /// A zero `size` is a no-op whatever `ptr` is. Never reports failure.
    ///
    /// # Safety
    ///
    /// `ptr` must come from [`allocate`](Self::allocate) (or
    /// [`reallocate`](Self::reallocate)) on this allocator with a `size` in the
    /// same size class as the original request (any `size > 128` for large
    /// blocks), and must not be used afterwards. Anything else corrupts the
    /// free lists or the system heap; hardened mode catches null, misaligned
    /// and already-free small blocks but is not a substitute for the contract.
    pub unsafe fn deallocate(&self, ptr: *mut u8, size: usize) {
        if size == 0 {
            return;
        }
        match size_class::class_index(size) {
            // SAFETY: forwarded caller contract.
            Some(class) => unsafe { self.deallocate_small(ptr, class) },
            None => {
                if let Some(block) = NonNull::new(ptr) {
                    // SAFETY: forwarded caller contract.
                    unsafe { self.large.deallocate(block, size) };
                }
            }
        }
    }

    /// Resizes a block.
    ///
    /// When both sizes are above 128 bytes the system heap resizes the block
    /// in place or moves it, preserving `min(old_size, new_size)` bytes; on
    /// error the original block is still owned by the caller.
    ///
    /// Every other combination is `deallocate(ptr, old_size)` followed by
    /// `allocate(new_size)`. Content is **not** copied: a block that lands in
    /// a different class or tier comes back with arbitrary contents, one that
    /// lands in the same class is usually the same block with its first word
    /// overwritten by a free-list link. On error the original block has
    /// already been released.
    ///
    /// # Safety
    ///
    /// Same contract as [`deallocate`](Self::deallocate) for `ptr`/`old_size`.
    pub unsafe fn reallocate(
        &self,
        ptr: *mut u8,
        old_size: usize,
        new_size: usize,
    ) -> Result<*mut u8, AllocError> {
        let both_large = old_size > size_class::MAX_SMALL_BYTES
            && new_size > size_class::MAX_SMALL_BYTES;
        if let (true, Some(block)) = (both_large, NonNull::new(ptr)) {
            // SAFETY: forwarded caller contract.
            let moved = unsafe { self.large.reallocate(block, old_size, new_size) };
            return match moved {
                Ok(block) => Ok(block.as_ptr()),
                Err(err) => {
                    self.record_large_failure("reallocate", new_size);
                    Err(err)
                }
            };
        }
        // SAFETY: forwarded caller contract.
        unsafe { self.deallocate(ptr, old_size) };
        self.allocate(new_size)
    }

    /// Replaces the OOM handler and returns the previous one.
    pub fn set_oom_handler(&self, handler: Option<OomHandler>) -> Option<OomHandler> {
        self.large.set_oom_handler(handler)
    }

    /// Currently registered OOM handler.
    pub fn oom_handler(&self) -> Option<OomHandler> {
        self.large.oom_handler()
    }

    /// Snapshot of counters, pool state and free-list lengths.
    pub fn stats(&self) -> AllocatorStats {
        let small = self.small.lock();
        let mut free_blocks = [0usize; NUM_SIZE_CLASSES];
        for (class, slot) in free_blocks.iter_mut().enumerate() {
            *slot = small.bank.len(class);
        }
        let c = small.counters;
        AllocatorStats {
            mode: self.config.mode,
            heap_size: small.pool.heap_size(),
            pool_remaining: small.pool.remaining(),
            pool_chunks: small.pool.chunk_count(),
            free_blocks,
            small_allocations: c.small_allocations,
            small_frees: c.small_frees,
            free_list_hits: c.free_list_hits,
            refills: c.refills,
            pool_growths: c.pool_growths,
            fragments_donated: c.fragments_donated,
            cannibalized: c.cannibalized,
            oom_escalations: c.oom_escalations,
            rejected_frees: c.rejected_frees,
            large_allocations: self.large.allocations(),
            oom_handler_invocations: self.large.oom_handler_invocations(),
        }
    }

    /// Copy of the buffered lifecycle records.
    pub fn lifecycle_logs(&self) -> Vec<AllocatorLogRecord> {
        self.small.lock().log.snapshot()
    }

    /// Takes the buffered lifecycle records.
    pub fn drain_lifecycle_logs(&self) -> Vec<AllocatorLogRecord> {
        self.small.lock().log.drain()
    }

    fn allocate_large(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.large.allocate(size).inspect_err(|_| {
            self.record_large_failure("allocate", size);
        })
    }

    fn record_large_failure(&self, symbol: &'static str, size: usize) {
        let mut small = self.small.lock();
        small.record(
            LogEvent::new(AllocatorLogLevel::Warn, symbol, "large_alloc", "oom").size(size),
            || "path=large_allocator".to_string(),
        );
    }

    fn allocate_small(&self, class: usize) -> Result<NonNull<u8>, AllocError> {
        let mut small = self.small.lock();
        if let Some(block) = small.bank.pop(class) {
            small.counters.small_allocations += 1;
            small.counters.free_list_hits += 1;
            small.record(
                LogEvent::new(AllocatorLogLevel::Trace, "allocate", "alloc", "success")
                    .ptr(block.as_ptr() as usize)
                    .class(class),
                || "path=free_list_hit".to_string(),
            );
            return Ok(block);
        }
        let block = self.refill(&mut small, size_class::class_size(class))?;
        small.counters.small_allocations += 1;
        Ok(block)
    }

    /// # Safety
    ///
    /// See [`deallocate`](Self::deallocate).
    unsafe fn deallocate_small(&self, ptr: *mut u8, class: usize) {
        let mut small = self.small.lock();
        let Some(block) = NonNull::new(ptr) else {
            if self.config.mode.validates_frees() {
                small.counters.rejected_frees += 1;
                small.record(
                    LogEvent::new(AllocatorLogLevel::Warn, "deallocate", "free", "rejected")
                        .class(class),
                    || "reason=null_pointer".to_string(),
                );
            }
            return;
        };
        if self.config.mode.validates_frees() {
            let reason = if block.as_ptr() as usize % ALIGN != 0 {
                Some("misaligned")
            } else if small.bank.contains(class, block) {
                Some("double_free")
            } else {
                None
            };
            if let Some(reason) = reason {
                small.counters.rejected_frees += 1;
                small.record(
                    LogEvent::new(AllocatorLogLevel::Warn, "deallocate", "free", "rejected")
                        .ptr(block.as_ptr() as usize)
                        .class(class),
                    || format!("reason={reason}"),
                );
                return;
            }
        }
        // SAFETY: caller guarantees `block` is a live block of this class that
        // it no longer uses.
        unsafe { small.bank.push(class, block) };
        small.counters.small_frees += 1;
        small.record(
            LogEvent::new(AllocatorLogLevel::Trace, "deallocate", "free", "success")
                .ptr(block.as_ptr() as usize)
                .class(class),
            String::new,
        );
    }

    /// Pulls a batch of `size`-byte blocks from the pool, returns the first
    /// and threads the rest onto the class list. A batch of one is returned
    /// without touching the list.
    fn refill(
        &self,
        small: &mut MutexGuard<'_, SmallHeap>,
        size: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let mut count = self.config.refill_batch.max(1);
        let chunk = self.chunk_alloc(small, size, &mut count)?;
        small.counters.refills += 1;
        let class = size_class::class_index(size).unwrap_or(NUM_SIZE_CLASSES - 1);
        small.record(
            LogEvent::new(AllocatorLogLevel::Debug, "refill", "refill", "success")
                .ptr(chunk.as_ptr() as usize)
                .size(size)
                .class(class),
            || format!("blocks={count}"),
        );
        if count == 1 {
            return Ok(chunk);
        }
        // SAFETY: `chunk_alloc` handed out `count * size` contiguous, unused,
        // 8-aligned bytes; the first block goes to the caller.
        unsafe {
            let rest = NonNull::new_unchecked(chunk.as_ptr().add(size));
            small.bank.thread(class, rest, size, count - 1);
        }
        Ok(chunk)
    }

    /// Obtains `*count` contiguous blocks of `size` bytes, growing the pool
    /// as needed. `*count` may be reduced, never below one.
    ///
    /// Growth order: system heap, then a free block of class `>= class(size)`,
    /// then the large-block OOM loop (run with the lock released). Each round
    /// either makes the pool non-empty or ends the request; after
    /// `max_growth_rounds` rounds the request fails.
    fn chunk_alloc(
        &self,
        small: &mut MutexGuard<'_, SmallHeap>,
        size: usize,
        count: &mut usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let class = size_class::class_index(size).unwrap_or(NUM_SIZE_CLASSES - 1);
        let oom = |requested: usize| AllocError::OutOfMemory { requested };

        let mut round = 0;
        loop {
            if let Some(block) = small.pool.carve(size, count) {
                return Ok(block);
            }
            if round == self.config.max_growth_rounds {
                break;
            }
            round += 1;

            let total = size.checked_mul(*count).ok_or_else(|| oom(size))?;
            let bytes_to_get = small.pool.growth_target(total).ok_or_else(|| oom(total))?;
            let request = bytes_to_get
                .checked_add(CHUNK_HEADER)
                .ok_or_else(|| oom(bytes_to_get))?;

            self.donate_fragment(small);

            if let Some(raw) = self.large.heap().allocate(request) {
                // SAFETY: fresh system allocation of `CHUNK_HEADER + bytes_to_get` bytes.
                unsafe { small.pool.install_chunk(raw, bytes_to_get) };
                small.counters.pool_growths += 1;
                small.record(
                    LogEvent::new(AllocatorLogLevel::Debug, "chunk_alloc", "pool_grow", "success")
                        .ptr(raw.as_ptr() as usize)
                        .size(bytes_to_get)
                        .class(class),
                    || format!("round={round};source=system"),
                );
                continue;
            }

            if let Some((block, from_class)) = small.bank.take_from_classes(class) {
                let len = size_class::class_size(from_class);
                // SAFETY: the block was free, so the pool now owns it exclusively.
                unsafe { small.pool.install_borrowed(block, len) };
                small.counters.cannibalized += 1;
                small.record(
                    LogEvent::new(AllocatorLogLevel::Info, "chunk_alloc", "cannibalize", "success")
                        .ptr(block.as_ptr() as usize)
                        .size(len)
                        .class(from_class),
                    || format!("round={round};wanted_class={class}"),
                );
                continue;
            }

            small.counters.oom_escalations += 1;
            small.record(
                LogEvent::new(AllocatorLogLevel::Warn, "chunk_alloc", "oom_escalate", "pending")
                    .size(bytes_to_get)
                    .class(class),
                || format!("round={round}"),
            );
            let grown = MutexGuard::unlocked(small, || self.large.allocate_for_pool(request));
            let raw = match grown {
                Ok(raw) => raw,
                Err(_) => {
                    small.record(
                        LogEvent::new(AllocatorLogLevel::Error, "chunk_alloc", "oom_escalate", "oom")
                            .size(bytes_to_get)
                            .class(class),
                        || format!("round={round}"),
                    );
                    return Err(oom(bytes_to_get));
                }
            };

            if small.pool.remaining() >= size {
                // Another thread grew the pool while the lock was released.
                // SAFETY: `raw` was never published.
                unsafe { self.large.deallocate(raw, request) };
                small.record(
                    LogEvent::new(AllocatorLogLevel::Debug, "chunk_alloc", "pool_grow", "discarded")
                        .size(bytes_to_get)
                        .class(class),
                    || format!("round={round};source=oom_loop"),
                );
                continue;
            }
            self.donate_fragment(small);
            // SAFETY: fresh allocation of `CHUNK_HEADER + bytes_to_get` bytes.
            unsafe { small.pool.install_chunk(raw, bytes_to_get) };
            small.counters.pool_growths += 1;
            small.record(
                LogEvent::new(AllocatorLogLevel::Info, "chunk_alloc", "pool_grow", "success")
                    .ptr(raw.as_ptr() as usize)
                    .size(bytes_to_get)
                    .class(class),
                || format!("round={round};source=oom_loop"),
            );
        }

        small.record(
            LogEvent::new(AllocatorLogLevel::Error, "chunk_alloc", "growth_rounds", "exhausted")
                .size(size)
                .class(class),
            || format!("max_growth_rounds={}", self.config.max_growth_rounds),
        );
        Err(oom(size.saturating_mul(*count)))
    }

    /// Links a pool leftover smaller than the requested block onto the free
    /// list of exactly its size, leaving the pool empty.
    fn donate_fragment(&self, small: &mut SmallHeap) {
        let Some((fragment, len)) = small.pool.take_fragment() else {
            return;
        };
        let Some(class) = size_class::class_index(len) else {
            // Only reachable with a leftover above 128 bytes, which the
            // carve rules never leave behind.
            return;
        };
        // SAFETY: the fragment was unused pool space; every pool boundary is a
        // multiple of 8 so the fragment is aligned and exactly `class_size` long.
        unsafe { small.bank.push(class, fragment) };
        small.counters.fragments_donated += 1;
        small.record(
            LogEvent::new(AllocatorLogLevel::Debug, "chunk_alloc", "fragment_donated", "success")
                .ptr(fragment.as_ptr() as usize)
                .size(len)
                .class(class),
            String::new,
        );
    }
}

impl<H: SystemHeap> Drop for TierAllocator<H> {
    fn drop(&mut self) {
        let small = self.small.get_mut();
        // SAFETY: `&mut self` means no block carved from the pool can still be
        // used through this allocator.
        unsafe { small.pool.release_chunks(self.large.heap()) };
    }
}

impl<H: SystemHeap> fmt::Debug for TierAllocator<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TierAllocator")
            .field("config", &self.config)
            .field("large", &self.large)
            .finish_non_exhaustive()
    }
}
