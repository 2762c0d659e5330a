//! hostwall Traffic Shaper
//!
//! Two independent controls:
//!
//! - [`TokenBucket`]: per-packet admission on the capture thread. It
//!   sleeps until enough tokens have accumulated, which throttles the whole
//!   capture loop; that backpressure is the point.
//! - [`InterfaceShaper`]: link-wide rate, burst and latency through `tc`
//!   (HTB root, one class, netem leaf).

pub mod bucket;
pub mod tc;

pub use bucket::{Admission, TokenBucket};
pub use tc::{
    CommandOutput, CommandRunner, InterfaceShaper, Preflight, ShapeProfile, SystemPreflight,
    TokioCommandRunner,
};

use thiserror::Error;

/// Shaper errors
#[derive(Error, Debug)]
pub enum ShaperError {
    #[error("interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("insufficient privilege to shape {0} (root required)")]
    NotPrivileged(String),

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("`{command}` failed (status {status:?}): {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
        stdout: String,
    },

    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ShaperError>;
