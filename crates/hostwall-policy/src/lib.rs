//! hostwall Rule Engine
//!
//! Ordered list of 5-tuple rules producing allow/block.
//!
//! # Evaluation
//!
//! ```text
//! 5-tuple ──▶ rule[0] ──▶ rule[1] ──▶ ... ──▶ no match
//!               │            │                   │
//!             action       action        interactive? ──no──▶ Block
//!                                                │
//!                                               yes
//!                                                │
//!                                   DecisionRequest ──▶ operator
//!                                                │
//!                                  decision ◀────┴────▶ timeout ──▶ Block
//!                                     │
//!                          rule inserted at front, persisted
//! ```
//!
//! Every mutation rewrites the backing JSON file before it becomes visible;
//! a failed write leaves the in-memory list untouched.

pub mod engine;
pub mod prompt;
pub mod rule;
pub mod store;

pub use engine::{
    Decision, DecisionReason, RuleEngine, RuleEngineConfig, RuleStats, DEFAULT_PROMPT_TIMEOUT,
};
pub use prompt::{DecisionRequest, PromptBroker};
pub use rule::{AddrMatch, Rule};
pub use store::RuleStore;

use hostwall_common::ValueError;
use std::path::PathBuf;
use thiserror::Error;

/// Rule engine errors
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("failed to access rule file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse rule file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode rules: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("invalid rule: {0}")]
    InvalidRule(#[from] ValueError),

    #[error("rule index {index} out of range ({len} rules)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("no decision is pending")]
    NoPendingPrompt,
}

pub type Result<T> = std::result::Result<T, PolicyError>;
