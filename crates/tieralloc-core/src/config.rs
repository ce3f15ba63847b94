//! Allocator configuration.
//!
//! The validation mode is set via the `TIERALLOC_MODE` environment variable:
//! - `strict` (default): the documented contract only. `deallocate` trusts its
//!   caller; a mismatched pointer/size is undefined behavior.
//! - `hardened`: small-block `deallocate` additionally rejects null,
//!   misaligned and already-free pointers. Rejected blocks are leaked and
//!   logged instead of corrupting a free list.
//!
//! Lifecycle record level is read from `TIERALLOC_LOG`
//! (`trace`|`debug`|`info`|`warn`|`error`|`off`).

use std::sync::atomic::{AtomicU8, Ordering};

use crate::log::AllocatorLogLevel;

/// Blocks requested from the pool per refill.
pub const DEFAULT_REFILL_BATCH: usize = 20;

/// Upper bound on pool-growth rounds for one chunk request.
pub const DEFAULT_MAX_GROWTH_ROUNDS: usize = 64;

/// Lifecycle records kept before the oldest are discarded.
pub const DEFAULT_LOG_CAPACITY: usize = 4096;

/// Deallocation validation mode.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocMode {
    /// Trust the caller's pointer/size precondition.
    #[default]
    Strict,
    /// Validate small-block frees before linking them.
    Hardened,
}

impl AllocMode {
    /// Parse from string (case-insensitive). Unknown values are strict.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "hardened" | "debug" | "checked" => Self::Hardened,
            _ => Self::Strict,
        }
    }

    /// Returns true if frees are validated.
    #[must_use]
    pub const fn validates_frees(self) -> bool {
        matches!(self, Self::Hardened)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Hardened => "hardened",
        }
    }
}

/// Tunables for a [`TierAllocator`](crate::TierAllocator).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Blocks requested from the pool when a free list runs dry.
    pub refill_batch: usize,
    /// Pool-growth rounds before a chunk request gives up. Zero disables growth.
    pub max_growth_rounds: usize,
    /// Cap on OOM handler invocations per request. `None` retries forever.
    pub oom_retry_limit: Option<u32>,
    /// Deallocation validation mode.
    pub mode: AllocMode,
    /// Minimum level of lifecycle records to keep. `None` records nothing.
    ///
    /// Must stay `None` when the allocator backs `#[global_allocator]`:
    /// records own heap-allocated strings.
    pub log_level: Option<AllocatorLogLevel>,
    /// Lifecycle records kept before the oldest are discarded.
    pub log_capacity: usize,
}

impl AllocatorConfig {
    /// Default configuration, usable in const context.
    pub const DEFAULT: Self = Self {
        refill_batch: DEFAULT_REFILL_BATCH,
        max_growth_rounds: DEFAULT_MAX_GROWTH_ROUNDS,
        oom_retry_limit: None,
        mode: AllocMode::Strict,
        log_level: None,
        log_capacity: DEFAULT_LOG_CAPACITY,
    };

    /// Default configuration with mode and log level taken from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        let log_level = std::env::var("TIERALLOC_LOG")
            .ok()
            .and_then(|raw| AllocatorLogLevel::from_str_loose(&raw));
        Self {
            mode: alloc_mode(),
            log_level,
            ..Self::DEFAULT
        }
    }

    #[must_use]
    pub const fn with_mode(mut self, mode: AllocMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub const fn with_log_level(mut self, level: Option<AllocatorLogLevel>) -> Self {
        self.log_level = level;
        self
    }

    #[must_use]
    pub const fn with_refill_batch(mut self, batch: usize) -> Self {
        self.refill_batch = if batch == 0 { 1 } else { batch };
        self
    }

    #[must_use]
    pub const fn with_max_growth_rounds(mut self, rounds: usize) -> Self {
        self.max_growth_rounds = rounds;
        self
    }

    #[must_use]
    pub const fn with_oom_retry_limit(mut self, limit: Option<u32>) -> Self {
        self.oom_retry_limit = limit;
        self
    }
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// Atomic cache: 0=unresolved, 1=Strict, 2=Hardened, 255=resolving.
// Not a OnceLock: reading the environment allocates, and when this crate backs
// the global allocator that allocation re-enters here.
static CACHED_MODE: AtomicU8 = AtomicU8::new(0);

const MODE_UNRESOLVED: u8 = 0;
const MODE_STRICT: u8 = 1;
const MODE_HARDENED: u8 = 2;
const MODE_RESOLVING: u8 = 255;

fn mode_to_u8(mode: AllocMode) -> u8 {
    match mode {
        AllocMode::Strict => MODE_STRICT,
        AllocMode::Hardened => MODE_HARDENED,
    }
}

fn u8_to_mode(v: u8) -> AllocMode {
    match v {
        MODE_HARDENED => AllocMode::Hardened,
        _ => AllocMode::Strict,
    }
}

/// Get the configured mode (reads `TIERALLOC_MODE` on first call, caches thereafter).
///
/// A call that arrives while another call is resolving the variable gets
/// `Strict` instead of blocking.
#[must_use]
pub fn alloc_mode() -> AllocMode {
    let cached = CACHED_MODE.load(Ordering::Relaxed);
    if cached != MODE_UNRESOLVED && cached != MODE_RESOLVING {
        return u8_to_mode(cached);
    }
    if cached == MODE_RESOLVING {
        return AllocMode::Strict;
    }

    if CACHED_MODE
        .compare_exchange(
            MODE_UNRESOLVED,
            MODE_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        let v = CACHED_MODE.load(Ordering::Relaxed);
        return if v != MODE_UNRESOLVED && v != MODE_RESOLVING {
            u8_to_mode(v)
        } else {
            AllocMode::Strict
        };
    }

    let mode = std::env::var("TIERALLOC_MODE")
        .map(|v| AllocMode::from_str_loose(&v))
        .unwrap_or_default();
    CACHED_MODE.store(mode_to_u8(mode), Ordering::Release);
    mode
}
