//! CLI Commands

pub mod logs;
pub mod rules;
pub mod run;
pub mod shape;
pub mod signatures;
pub mod simulate;

use crate::config::Config;
use anyhow::{Context, Result};
use hostwall_common::LinkType;
use hostwall_dataplane::Pipeline;
use hostwall_dpi::{default_signatures, SignatureEngine};
use hostwall_policy::{RuleEngine, RuleEngineConfig};
use hostwall_shaper::TokenBucket;
use std::sync::Arc;
use std::time::Duration;

/// Defaults first (when enabled), then configured signatures in file order
pub fn build_signatures(config: &Config) -> Result<SignatureEngine> {
    let engine = SignatureEngine::new();
    if config.dpi.load_defaults {
        engine.add_all(default_signatures()).context("failed to load default signatures")?;
    }
    engine
        .add_all(config.dpi.signatures.iter().cloned())
        .context("invalid dpi.signatures")?;
    Ok(engine)
}

pub fn build_rules(config: RuleEngineConfig) -> Result<RuleEngine> {
    let path = config.path.clone();
    RuleEngine::open(config).with_context(|| match path {
        Some(path) => format!("failed to load rules from {}", path.display()),
        None => "failed to load rules".to_string(),
    })
}

pub fn build_bucket(config: &Config) -> Result<Option<Arc<TokenBucket>>> {
    if !config.shaper.enabled {
        return Ok(None);
    }
    let bucket = TokenBucket::with_wait_step(
        config.shaper.rate_bytes_per_sec,
        Duration::from_millis(config.shaper.max_wait_step_ms),
    )
    .context("invalid [shaper] settings")?;
    Ok(Some(Arc::new(bucket)))
}

pub fn build_pipeline(config: &Config, rules: Arc<RuleEngine>, link: LinkType) -> Result<Pipeline> {
    let signatures = Arc::new(build_signatures(config)?);
    Ok(Pipeline::standard(
        link,
        rules,
        signatures,
        build_bucket(config)?,
        config.dpi.enforce_block_signatures,
    ))
}
