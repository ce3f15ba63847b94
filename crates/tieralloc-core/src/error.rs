//! Allocator error type.

use thiserror::Error;

/// Failure of an allocation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The system heap could not satisfy the request and every escalation
    /// (OOM handler, pool fragment reuse, cannibalizing larger free blocks)
    /// was exhausted.
    #[error("out of memory: {requested} bytes requested")]
    OutOfMemory { requested: usize },
    /// `count * size_of::<T>()` does not fit in `usize`.
    #[error("capacity overflow")]
    CapacityOverflow,
    /// The element type needs a stricter alignment than blocks provide.
    #[error("alignment {align} exceeds the 8-byte block alignment")]
    UnsupportedAlignment { align: usize },
}

impl AllocError {
    /// Returns true for the out-of-memory condition.
    #[must_use]
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}
