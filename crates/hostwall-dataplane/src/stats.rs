//! Capture Statistics
//!
//! Lock-free counters updated on the capture thread.

use hostwall_common::{AtomicCounter, Verdict};
use serde::Serialize;

/// Capture loop counters
#[derive(Debug, Default)]
pub struct CaptureStats {
    /// Packets received from the queue
    pub total: AtomicCounter,
    /// Packets accepted
    pub accepted: AtomicCounter,
    /// Packets dropped
    pub dropped: AtomicCounter,
    /// Evaluation panics and failed verdict writes
    pub errors: AtomicCounter,
    /// Bytes received
    pub bytes: AtomicCounter,
}

impl CaptureStats {
    #[inline(always)]
    pub fn record_rx(&self, bytes: usize) {
        self.total.inc();
        self.bytes.add(bytes as u64);
    }

    #[inline(always)]
    pub fn record_verdict(&self, verdict: Verdict) {
        match verdict {
            Verdict::Accept => self.accepted.inc(),
            Verdict::Drop => self.dropped.inc(),
        };
    }

    #[inline(always)]
    pub fn record_error(&self) {
        self.errors.inc();
    }

    pub fn snapshot(&self) -> CaptureStatsSnapshot {
        CaptureStatsSnapshot {
            total: self.total.get(),
            accepted: self.accepted.get(),
            dropped: self.dropped.get(),
            errors: self.errors.get(),
            bytes: self.bytes.get(),
        }
    }
}

/// Stats snapshot (non-atomic)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CaptureStatsSnapshot {
    pub total: u64,
    pub accepted: u64,
    pub dropped: u64,
    pub errors: u64,
    pub bytes: u64,
}
