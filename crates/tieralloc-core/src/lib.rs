//! # tieralloc-core
//!
//! A two-tier general-purpose memory allocator.
//!
//! Requests above 128 bytes are delegated to the system heap, with an
//! optional out-of-memory handler retried until memory appears. Requests of
//! 128 bytes or less are bucketed into 16 size classes of 8-byte granularity
//! and served from intrusive LIFO free lists, refilled in batches from a bump
//! pool that grows geometrically. When the system heap is exhausted the pool
//! reuses free blocks of larger classes before escalating to the OOM handler.
//!
//! Unsafe code is confined to the modules that manipulate raw blocks.

#![deny(unsafe_code)]

pub mod allocator;
pub mod config;
pub mod error;
mod free_list;
pub mod global;
pub mod large;
pub mod log;
mod pool;
pub mod size_class;
pub mod stats;
pub mod system;
pub mod typed;

pub use allocator::TierAllocator;
pub use config::{AllocMode, AllocatorConfig};
pub use error::AllocError;
pub use large::{LargeAllocator, OomHandler};
pub use log::{AllocatorLogLevel, AllocatorLogRecord};
pub use pool::CHUNK_HEADER;
pub use stats::AllocatorStats;
pub use system::{FailingHeap, HeapCall, LibcHeap, SystemHeap};
pub use typed::TypedAlloc;
