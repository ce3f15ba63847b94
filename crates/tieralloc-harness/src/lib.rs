//! Workload harness for tieralloc.
//!
//! This crate provides:
//! - Deterministic churn workloads with content verification
//! - Reuse checks (LIFO reuse, refill contiguity)
//! - OOM-loop drills over a failing system heap
//! - JSON reports and JSONL lifecycle logs

#![deny(unsafe_code)]

pub mod error;
pub mod structured_log;
pub mod workload;

pub use error::HarnessError;
pub use structured_log::{LogRecord, parse_log_level, write_jsonl};
pub use workload::{
    ChurnConfig, ChurnReport, OomConfig, OomReport, ReuseReport, RunOutput, StatsReport,
    Xorshift64, run_churn, run_oom, run_reuse,
};
