//! hostwall Common - Shared types for the packet-to-verdict path
//!
//! This crate provides the vocabulary every stage of the verdict pipeline
//! speaks:
//! - Canonical packet view and 5-tuple
//! - Policy actions and kernel verdicts
//! - Structured log entries
//! - Lock-free counters
//!
//! # Flow
//!
//! ```text
//! raw bytes ──► PacketView ──► FiveTuple ──► Action ──► Verdict
//!                   │                                     │
//!                   └──────────── LogEntry ◄──────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod packet;
pub mod policy;
pub mod event;
pub mod error;

pub use packet::*;
pub use policy::*;
pub use event::*;
pub use error::*;

use std::sync::atomic::{AtomicU64, Ordering};

/// High-performance counter for lock-free metrics
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Create new counter
    pub const fn new(value: u64) -> Self {
        Self(AtomicU64::new(value))
    }

    /// Increment and return previous value
    #[inline(always)]
    pub fn inc(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }

    /// Add value and return previous
    #[inline(always)]
    pub fn add(&self, val: u64) -> u64 {
        self.0.fetch_add(val, Ordering::Relaxed)
    }

    /// Get current value
    #[inline(always)]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}
