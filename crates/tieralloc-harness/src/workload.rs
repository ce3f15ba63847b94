//! Deterministic allocator workloads.
//!
//! Every workload runs against a fresh [`TierAllocator`] over a
//! [`FailingHeap`], so system-heap traffic is counted and can be made to fail
//! on demand.

#![allow(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tieralloc_core::size_class::MAX_SMALL_BYTES;
use tieralloc_core::{
    AllocMode, AllocatorConfig, AllocatorLogLevel, AllocatorStats, FailingHeap, TierAllocator,
};

use crate::HarnessError;
use crate::structured_log::LogRecord;

type HarnessAllocator = TierAllocator<FailingHeap>;

/// xorshift64 generator. A zero seed is remapped so the sequence never stalls.
#[derive(Debug, Clone)]
pub struct Xorshift64 {
    state: u64,
}

impl Xorshift64 {
    pub fn new(seed: u64) -> Self {
        let state = if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed };
        Self { state }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Uniform-ish value in `0..bound`; `bound` must be non-zero.
    pub fn next_below(&mut self, bound: usize) -> usize {
        (self.next_u64() % bound as u64) as usize
    }
}

/// A workload report plus the lifecycle records it produced.
#[derive(Debug, Clone)]
pub struct RunOutput<R> {
    pub report: R,
    pub records: Vec<LogRecord>,
}

fn finish<R>(alloc: &HarnessAllocator, report: R) -> RunOutput<R> {
    let records = alloc
        .drain_lifecycle_logs()
        .iter()
        .map(LogRecord::from)
        .collect();
    RunOutput { report, records }
}

/// JSON view of [`AllocatorStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsReport {
    pub mode: String,
    pub heap_size: usize,
    pub pool_remaining: usize,
    pub pool_chunks: usize,
    pub free_blocks: Vec<usize>,
    pub free_list_bytes: usize,
    pub small_allocations: u64,
    pub small_frees: u64,
    pub free_list_hits: u64,
    pub free_list_hit_rate_permille: u16,
    pub refills: u64,
    pub pool_growths: u64,
    pub fragments_donated: u64,
    pub cannibalized: u64,
    pub oom_escalations: u64,
    pub rejected_frees: u64,
    pub large_allocations: u64,
    pub oom_handler_invocations: u64,
}

impl From<&AllocatorStats> for StatsReport {
    fn from(s: &AllocatorStats) -> Self {
        Self {
            mode: s.mode.as_str().to_string(),
            heap_size: s.heap_size,
            pool_remaining: s.pool_remaining,
            pool_chunks: s.pool_chunks,
            free_blocks: s.free_blocks.to_vec(),
            free_list_bytes: s.free_list_bytes(),
            small_allocations: s.small_allocations,
            small_frees: s.small_frees,
            free_list_hits: s.free_list_hits,
            free_list_hit_rate_permille: s.free_list_hit_rate_permille(),
            refills: s.refills,
            pool_growths: s.pool_growths,
            fragments_donated: s.fragments_donated,
            cannibalized: s.cannibalized,
            oom_escalations: s.oom_escalations,
            rejected_frees: s.rejected_frees,
            large_allocations: s.large_allocations,
            oom_handler_invocations: s.oom_handler_invocations,
        }
    }
}

// ---------------------------------------------------------------------------
// Churn
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ChurnConfig {
    pub seed: u64,
    pub ops: usize,
    /// Requests are drawn from `1..=max_size`.
    pub max_size: usize,
    pub mode: AllocMode,
    pub log_level: Option<AllocatorLogLevel>,
}

impl Default for ChurnConfig {
    fn default() -> Self {
        Self {
            seed: 0xDEAD_BEEF,
            ops: 10_000,
            max_size: 256,
            mode: AllocMode::Strict,
            log_level: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChurnReport {
    pub seed: u64,
    pub ops: usize,
    pub max_size: usize,
    pub mode: String,
    pub allocations: u64,
    pub deallocations: u64,
    pub reallocations: u64,
    pub small_requests: u64,
    pub large_requests: u64,
    pub peak_live: usize,
    /// Blocks whose fill pattern changed while they were live.
    pub corrupted_blocks: u64,
    pub system_allocate_calls: usize,
    /// System blocks still held after every workload block was returned.
    pub outstanding_system_blocks: isize,
    pub stats: StatsReport,
}

struct LiveBlock {
    ptr: *mut u8,
    size: usize,
    fill: u8,
}

impl LiveBlock {
    fn intact(&self) -> bool {
        // SAFETY: the block is live and was filled over `size` bytes.
        let bytes = unsafe { std::slice::from_raw_parts(self.ptr, self.size) };
        bytes.iter().all(|&b| b == self.fill)
    }
}

fn fill_block(ptr: *mut u8, size: usize, fill: u8) {
    // SAFETY: callers pass freshly allocated blocks of `size` bytes.
    unsafe { std::ptr::write_bytes(ptr, fill, size) };
}

/// Runs a random mix of allocate / deallocate / reallocate, filling every
/// block with a per-block byte and checking it before release.
pub fn run_churn(config: &ChurnConfig) -> Result<RunOutput<ChurnReport>, HarnessError> {
    if config.max_size == 0 {
        return Err(HarnessError::InvalidArgument(
            "max-size must be at least 1".to_string(),
        ));
    }
    let alloc = TierAllocator::with_heap(
        FailingHeap::new(),
        AllocatorConfig::DEFAULT
            .with_mode(config.mode)
            .with_log_level(config.log_level),
    );
    let mut rng = Xorshift64::new(config.seed);
    let mut live: Vec<LiveBlock> = Vec::new();
    let mut report = ChurnReport {
        seed: config.seed,
        ops: config.ops,
        max_size: config.max_size,
        mode: config.mode.as_str().to_string(),
        allocations: 0,
        deallocations: 0,
        reallocations: 0,
        small_requests: 0,
        large_requests: 0,
        peak_live: 0,
        corrupted_blocks: 0,
        system_allocate_calls: 0,
        outstanding_system_blocks: 0,
        stats: StatsReport::from(&alloc.stats()),
    };

    for _ in 0..config.ops {
        let roll = rng.next_u64() % 8;
        let size = rng.next_below(config.max_size) + 1;
        let fill = (rng.next_u64() & 0xff) as u8;
        if size <= MAX_SMALL_BYTES {
            report.small_requests += 1;
        } else {
            report.large_requests += 1;
        }

        match roll {
            0..=3 => {
                let ptr = alloc.allocate(size)?;
                fill_block(ptr, size, fill);
                live.push(LiveBlock { ptr, size, fill });
                report.allocations += 1;
            }
            4..=5 if !live.is_empty() => {
                let block = live.swap_remove(rng.next_below(live.len()));
                if !block.intact() {
                    report.corrupted_blocks += 1;
                }
                // SAFETY: the block is live with its original size.
                unsafe { alloc.deallocate(block.ptr, block.size) };
                report.deallocations += 1;
            }
            6..=7 if !live.is_empty() => {
                let block = live.swap_remove(rng.next_below(live.len()));
                if !block.intact() {
                    report.corrupted_blocks += 1;
                }
                // SAFETY: the block is live with its original size; its content
                // is rewritten below whatever the path.
                let ptr = unsafe { alloc.reallocate(block.ptr, block.size, size)? };
                fill_block(ptr, size, fill);
                live.push(LiveBlock { ptr, size, fill });
                report.reallocations += 1;
            }
            _ => {
                let ptr = alloc.allocate(size)?;
                fill_block(ptr, size, fill);
                live.push(LiveBlock { ptr, size, fill });
                report.allocations += 1;
            }
        }
        report.peak_live = report.peak_live.max(live.len());
    }

    for block in live.drain(..) {
        if !block.intact() {
            report.corrupted_blocks += 1;
        }
        // SAFETY: the block is live with its original size.
        unsafe { alloc.deallocate(block.ptr, block.size) };
    }

    report.system_allocate_calls = alloc.heap().allocate_calls();
    report.outstanding_system_blocks = alloc.heap().outstanding() - alloc.stats().pool_chunks as isize;
    report.stats = StatsReport::from(&alloc.stats());
    Ok(finish(&alloc, report))
}

// ---------------------------------------------------------------------------
// Reuse
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReuseReport {
    pub sizes_checked: usize,
    /// Sizes whose freed block was not handed straight back.
    pub lifo_failures: Vec<usize>,
    /// Distances between consecutive blocks served from a class-0 refill.
    pub refill_strides: Vec<usize>,
    pub contiguous: bool,
    pub passed: bool,
}

/// Checks LIFO reuse for every small size and contiguity of a class-0 refill.
pub fn run_reuse(log_level: Option<AllocatorLogLevel>) -> Result<RunOutput<ReuseReport>, HarnessError> {
    let config = AllocatorConfig::DEFAULT.with_log_level(log_level);

    let alloc = TierAllocator::with_heap(FailingHeap::new(), config);
    let first = alloc.allocate(8)? as usize;
    let mut strides = Vec::with_capacity(19);
    let mut prev = first;
    for _ in 0..19 {
        let next = alloc.allocate(8)? as usize;
        strides.push(next.wrapping_sub(prev));
        prev = next;
    }
    let contiguous = strides.iter().all(|&d| d == 8);

    let mut lifo_failures = Vec::new();
    for n in 1..=MAX_SMALL_BYTES {
        let p = alloc.allocate(n)?;
        // SAFETY: p is live with `n` bytes.
        unsafe { alloc.deallocate(p, n) };
        if alloc.allocate(n)? != p {
            lifo_failures.push(n);
        }
    }

    let report = ReuseReport {
        sizes_checked: MAX_SMALL_BYTES,
        passed: contiguous && lifo_failures.is_empty(),
        lifo_failures,
        refill_strides: strides,
        contiguous,
    };
    Ok(finish(&alloc, report))
}

// ---------------------------------------------------------------------------
// OOM
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OomConfig {
    /// System allocations that fail before the heap recovers.
    pub fail_first: usize,
    pub with_handler: bool,
    pub size: usize,
    pub log_level: Option<AllocatorLogLevel>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OomReport {
    pub fail_first: usize,
    pub with_handler: bool,
    pub size: usize,
    pub path: String,
    /// `success` or the error message.
    pub outcome: String,
    pub handler_invocations: u64,
    pub system_allocate_calls: usize,
    pub stats: StatsReport,
}

/// Fails the first `fail_first` system allocations and issues one request.
pub fn run_oom(config: &OomConfig) -> Result<RunOutput<OomReport>, HarnessError> {
    if config.size == 0 {
        return Err(HarnessError::InvalidArgument(
            "size must be at least 1".to_string(),
        ));
    }
    let alloc = TierAllocator::with_heap(
        FailingHeap::new(),
        AllocatorConfig::DEFAULT.with_log_level(config.log_level),
    );
    let invocations = Arc::new(AtomicU64::new(0));
    if config.with_handler {
        let seen = Arc::clone(&invocations);
        alloc.set_oom_handler(Some(Arc::new(move || {
            seen.fetch_add(1, Ordering::Relaxed);
        })));
    }

    alloc.heap().fail_next(config.fail_first);
    let outcome = match alloc.allocate(config.size) {
        Ok(ptr) => {
            // SAFETY: ptr is live with `size` bytes.
            unsafe { alloc.deallocate(ptr, config.size) };
            "success".to_string()
        }
        Err(err) => err.to_string(),
    };

    let path = if config.size <= MAX_SMALL_BYTES {
        "small"
    } else {
        "large"
    };
    let report = OomReport {
        fail_first: config.fail_first,
        with_handler: config.with_handler,
        size: config.size,
        path: path.to_string(),
        outcome,
        handler_invocations: invocations.load(Ordering::Relaxed),
        system_allocate_calls: alloc.heap().allocate_calls(),
        stats: StatsReport::from(&alloc.stats()),
    };
    Ok(finish(&alloc, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tieralloc_core::size_class::NUM_SIZE_CLASSES;

    #[test]
    fn xorshift_is_deterministic() {
        let mut a = Xorshift64::new(42);
        let mut b = Xorshift64::new(42);
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
        let mut z = Xorshift64::new(0);
        assert_ne!(z.next_u64(), 0);
    }

    #[test]
    fn stats_report_has_every_class() {
        let alloc = TierAllocator::with_heap(FailingHeap::new(), AllocatorConfig::DEFAULT);
        alloc.allocate(8).unwrap();
        let report = StatsReport::from(&alloc.stats());
        assert_eq!(report.free_blocks.len(), NUM_SIZE_CLASSES);
        assert_eq!(report.free_blocks[0], 19);
        assert_eq!(report.free_list_bytes, 19 * 8);
    }

    #[test]
    fn churn_rejects_zero_max_size() {
        let config = ChurnConfig {
            max_size: 0,
            ..ChurnConfig::default()
        };
        assert!(matches!(
            run_churn(&config),
            Err(HarnessError::InvalidArgument(_))
        ));
    }
}
