//! Structured allocator lifecycle records.
//!
//! Every notable decision (refill, pool growth, fragment donation,
//! cannibalization, OOM escalation, rejected free) can be captured as an
//! [`AllocatorLogRecord`] carrying a monotonic decision id and a snapshot of
//! the pool. Records are buffered in the allocator's locked state and handed
//! out through `lifecycle_logs` / `drain_lifecycle_logs`.

use std::collections::VecDeque;

/// Allocator lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AllocatorLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl AllocatorLogLevel {
    /// Parse from string (case-insensitive). `off`/unknown yield `None`.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Structured allocator lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorLogRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    /// Correlation id for this lifecycle record.
    pub trace_id: String,
    /// Severity level.
    pub level: AllocatorLogLevel,
    /// API symbol (`allocate`, `deallocate`, `reallocate`, `refill`, ...).
    pub symbol: &'static str,
    /// Event kind (`pool_grow`, `fragment_donated`, `cannibalize`, ...).
    pub event: &'static str,
    /// Address involved in the event.
    pub ptr: Option<usize>,
    /// Size value involved in the event.
    pub size: Option<usize>,
    /// Size class involved in the event.
    pub class: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    /// Free-form details for debugging.
    pub details: String,
    /// Snapshot: total bytes ever acquired for the pool.
    pub heap_size: usize,
    /// Snapshot: bytes left in the active pool range.
    pub pool_remaining: usize,
}

/// Fields of a record before the buffer stamps ids and snapshots.
pub(crate) struct LogEvent {
    pub level: AllocatorLogLevel,
    pub symbol: &'static str,
    pub event: &'static str,
    pub ptr: Option<usize>,
    pub size: Option<usize>,
    pub class: Option<usize>,
    pub outcome: &'static str,
}

impl LogEvent {
    pub(crate) const fn new(
        level: AllocatorLogLevel,
        symbol: &'static str,
        event: &'static str,
        outcome: &'static str,
    ) -> Self {
        Self {
            level,
            symbol,
            event,
            ptr: None,
            size: None,
            class: None,
            outcome,
        }
    }

    pub(crate) const fn ptr(mut self, ptr: usize) -> Self {
        self.ptr = Some(ptr);
        self
    }

    pub(crate) const fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    pub(crate) const fn class(mut self, class: usize) -> Self {
        self.class = Some(class);
        self
    }
}

/// Bounded lifecycle buffer.
pub(crate) struct LifecycleLog {
    threshold: Option<AllocatorLogLevel>,
    capacity: usize,
    next_decision_id: u64,
    records: VecDeque<AllocatorLogRecord>,
}

impl LifecycleLog {
    pub(crate) const fn new(threshold: Option<AllocatorLogLevel>, capacity: usize) -> Self {
        Self {
            threshold,
            capacity,
            next_decision_id: 1,
            records: VecDeque::new(),
        }
    }

    /// Returns true if a record at `level` would be kept.
    pub(crate) fn enabled(&self, level: AllocatorLogLevel) -> bool {
        self.threshold.is_some_and(|min| level >= min) && self.capacity > 0
    }

    fn next_log_decision_id(&mut self) -> u64 {
        let id = self.next_decision_id;
        self.next_decision_id = self.next_decision_id.wrapping_add(1);
        id
    }

    /// Stamps and stores `event`. `details` is only evaluated for kept records.
    pub(crate) fn record(
        &mut self,
        event: LogEvent,
        heap_size: usize,
        pool_remaining: usize,
        details: impl FnOnce() -> String,
    ) {
        if !self.enabled(event.level) {
            return;
        }
        let decision_id = self.next_log_decision_id();
        let trace_id = format!("tieralloc::{}::{:016x}", event.symbol, decision_id);
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(AllocatorLogRecord {
            decision_id,
            trace_id,
            level: event.level,
            symbol: event.symbol,
            event: event.event,
            ptr: event.ptr,
            size: event.size,
            class: event.class,
            outcome: event.outcome,
            details: details(),
            heap_size,
            pool_remaining,
        });
    }

    pub(crate) fn snapshot(&self) -> Vec<AllocatorLogRecord> {
        self.records.iter().cloned().collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<AllocatorLogRecord> {
        self.records.drain(..).collect()
    }
}
