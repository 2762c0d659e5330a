//! Error types shared across hostwall crates

use thiserror::Error;

/// Failure to parse one of the textual forms used in rule files,
/// configuration and the CLI.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    /// Unrecognised action keyword
    #[error("unknown action: {0:?}")]
    Action(String),

    /// Unrecognised protocol keyword or number
    #[error("unknown protocol: {0:?}")]
    Protocol(String),

    /// Unrecognised link-layer framing
    #[error("unknown link type: {0:?}")]
    LinkType(String),

    /// Port outside 0..=65535 or not numeric
    #[error("invalid port: {0:?}")]
    Port(String),

    /// Address or network that does not parse
    #[error("invalid address: {0:?}")]
    Address(String),
}

/// Result type for value parsing
pub type ValueResult<T> = Result<T, ValueError>;
