//! Point-in-time allocator statistics.

use crate::config::AllocMode;
use crate::size_class::{NUM_SIZE_CLASSES, class_size};

/// Monotonic small-tier event counters, kept under the allocator lock.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SmallCounters {
    pub small_allocations: u64,
    pub small_frees: u64,
    pub free_list_hits: u64,
    pub refills: u64,
    pub pool_growths: u64,
    pub fragments_donated: u64,
    pub cannibalized: u64,
    pub oom_escalations: u64,
    pub rejected_frees: u64,
}

impl SmallCounters {
    pub(crate) const fn new() -> Self {
        Self {
            small_allocations: 0,
            small_frees: 0,
            free_list_hits: 0,
            refills: 0,
            pool_growths: 0,
            fragments_donated: 0,
            cannibalized: 0,
            oom_escalations: 0,
            rejected_frees: 0,
        }
    }
}

/// Snapshot returned by [`TierAllocator::stats`](crate::TierAllocator::stats).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorStats {
    pub mode: AllocMode,
    /// Total usable bytes ever acquired for the pool.
    pub heap_size: usize,
    /// Bytes left in the active pool range.
    pub pool_remaining: usize,
    /// System chunks currently registered with the pool.
    pub pool_chunks: usize,
    /// Free blocks per size class.
    pub free_blocks: [usize; NUM_SIZE_CLASSES],
    pub small_allocations: u64,
    pub small_frees: u64,
    /// Small allocations served straight from a free list.
    pub free_list_hits: u64,
    pub refills: u64,
    /// Chunks installed from the system heap (directly or via the OOM loop).
    pub pool_growths: u64,
    /// Pool leftovers linked onto the free list of their size.
    pub fragments_donated: u64,
    /// Free blocks of a larger class reused as the pool after a failed growth.
    pub cannibalized: u64,
    /// Growths that fell back to the large-block OOM loop.
    pub oom_escalations: u64,
    /// Frees refused by hardened mode.
    pub rejected_frees: u64,
    /// Blocks above 128 bytes handed to callers. Pool chunks are counted in
    /// `pool_growths` only.
    pub large_allocations: u64,
    pub oom_handler_invocations: u64,
}

impl AllocatorStats {
    /// Free blocks across all classes.
    #[must_use]
    pub fn total_free_blocks(&self) -> usize {
        self.free_blocks.iter().sum()
    }

    /// Bytes sitting on free lists.
    #[must_use]
    pub fn free_list_bytes(&self) -> usize {
        self.free_blocks
            .iter()
            .enumerate()
            .map(|(class, &n)| n * class_size(class))
            .sum()
    }

    /// Share of small allocations served from a free list, in permille.
    #[must_use]
    pub fn free_list_hit_rate_permille(&self) -> u16 {
        if self.small_allocations == 0 {
            return 0;
        }
        ((self.free_list_hits.saturating_mul(1000)) / self.small_allocations) as u16
    }
}
