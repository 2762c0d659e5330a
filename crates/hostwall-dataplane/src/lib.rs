//! hostwall Dataplane - Packet-to-verdict path
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── capture thread ────────────────────────────┐
//! │                                                                         │
//! │  PacketQueue ──► extract ──► RuleStage ──► DpiStage ──► ShapeStage     │
//! │      ▲                          │             │             │           │
//! │      │                        Block     Block (opt-in)   admit/delay    │
//! │      │                          ▼             ▼             ▼           │
//! │      └──────── verdict ◄──── Evaluation ──► EventSink (non-blocking)    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! One thread owns the queue handle. Every packet runs the stages
//! synchronously and receives exactly one verdict, Drop if anything on the
//! way fails.

#![warn(clippy::all)]

pub mod capture;
pub mod parse;
pub mod pipeline;
pub mod queue;
pub mod stats;

pub use capture::{CaptureConfig, CaptureLoop, CaptureState};
pub use parse::extract;
pub use pipeline::{
    DpiStage, Evaluation, PacketContext, Pipeline, RuleStage, ShapeStage, Stage, StageResult,
};
pub use queue::{
    ChannelOpener, ChannelQueue, Interrupt, PacketQueue, QueueHandle, QueueOpener, QueuedPacket,
    Received,
};
pub use stats::{CaptureStats, CaptureStatsSnapshot};

#[cfg(all(feature = "nfqueue", target_os = "linux"))]
pub use queue::nfqueue::{NfqOpener, NfqQueue};

use thiserror::Error;

/// Capture errors
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open queue {queue_id}: {source}")]
    QueueOpen {
        queue_id: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("queue I/O error: {0}")]
    Queue(#[from] std::io::Error),

    #[error("capture loop not initialized")]
    NotInitialized,

    #[error("capture loop already initialized")]
    AlreadyInitialized,

    #[error("failed to spawn capture thread: {0}")]
    Spawn(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CaptureError>;
