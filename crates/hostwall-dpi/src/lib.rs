//! hostwall Deep Packet Inspection
//!
//! Ordered, mutable set of named byte-pattern signatures that classify a
//! transport payload.
//!
//! ## Semantics
//!
//! - **First match wins**: signatures are tried in registration order, no
//!   scoring, no longest-match preference
//! - **Binary safe**: patterns run over raw bytes, never assumed UTF-8
//! - **ASCII case folding** when a signature is case-insensitive
//! - **No match is `Unknown`**, which is a protocol statement, not a permit
//!
//! Compilation failures reject the add; nothing half-installed is left in
//! the engine.

pub mod compiler;
pub mod defaults;
pub mod engine;

pub use compiler::{compile_pattern, CompiledSignature};
pub use defaults::default_signatures;
pub use engine::{EngineStats, EngineStatsSnapshot, Inspection, SignatureEngine, SignatureInfo, SignatureSpec};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// DPI engine errors
#[derive(Error, Debug)]
pub enum DpiError {
    #[error("signature already exists: {0}")]
    Duplicate(String),

    #[error("invalid pattern {pattern:?} for signature {name:?}: {source}")]
    InvalidPattern {
        name: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("signature not found: {0}")]
    NotFound(String),

    #[error("signature name must not be empty")]
    EmptyName,

    #[error("unknown classification: {0:?}")]
    UnknownClassification(String),
}

pub type Result<T> = std::result::Result<T, DpiError>;

/// Outcome attached to a signature
///
/// `Allow` and `Block` are policy results kept for signature sets that were
/// authored that way; the others identify a protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Classification {
    Allow,
    Block,
    Http,
    Dns,
    Tls,
    Ssh,
    Ftp,
    Smtp,
    Quic,
    None,
    /// No signature matched
    Unknown,
}

impl Classification {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "ALLOW",
            Self::Block => "BLOCK",
            Self::Http => "HTTP",
            Self::Dns => "DNS",
            Self::Tls => "TLS",
            Self::Ssh => "SSH",
            Self::Ftp => "FTP",
            Self::Smtp => "SMTP",
            Self::Quic => "QUIC",
            Self::None => "NONE",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Whether this names a protocol rather than a policy outcome
    pub fn is_protocol(&self) -> bool {
        !matches!(self, Self::Allow | Self::Block | Self::None | Self::Unknown)
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = DpiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ALLOW" => Ok(Self::Allow),
            "BLOCK" => Ok(Self::Block),
            "HTTP" => Ok(Self::Http),
            "DNS" => Ok(Self::Dns),
            "TLS" => Ok(Self::Tls),
            "SSH" => Ok(Self::Ssh),
            "FTP" => Ok(Self::Ftp),
            "SMTP" => Ok(Self::Smtp),
            "QUIC" => Ok(Self::Quic),
            "NONE" => Ok(Self::None),
            "UNKNOWN" => Ok(Self::Unknown),
            _ => Err(DpiError::UnknownClassification(s.to_string())),
        }
    }
}

impl TryFrom<String> for Classification {
    type Error = DpiError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Classification> for String {
    fn from(value: Classification) -> Self {
        value.as_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_keywords() {
        assert_eq!("http".parse::<Classification>().unwrap(), Classification::Http);
        assert_eq!("QUIC".parse::<Classification>().unwrap(), Classification::Quic);
        assert!("gopher".parse::<Classification>().is_err());
        assert!(Classification::Tls.is_protocol());
        assert!(!Classification::Unknown.is_protocol());
        assert!(!Classification::Block.is_protocol());
    }
}
