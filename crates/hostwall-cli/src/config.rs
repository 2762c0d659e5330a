//! hostwall Configuration
//!
//! TOML file, every section optional. A missing file means defaults.

use anyhow::{bail, Context, Result};
use hostwall_common::LinkType;
use hostwall_dataplane::CaptureConfig;
use hostwall_dpi::SignatureSpec;
use hostwall_events::EventLogConfig;
use hostwall_policy::RuleEngineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/hostwall/hostwall.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub capture: CaptureSection,
    pub rules: RulesSection,
    pub dpi: DpiSection,
    pub shaper: ShaperSection,
    pub events: EventsSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureSection {
    pub queue_id: u16,
    pub buffer_size: usize,
    pub link_type: LinkType,
}

impl Default for CaptureSection {
    fn default() -> Self {
        let capture = CaptureConfig::default();
        Self {
            queue_id: capture.queue_id,
            buffer_size: capture.buffer_size,
            link_type: LinkType::Raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RulesSection {
    pub path: PathBuf,
    pub interactive: bool,
    pub prompt_timeout_secs: u64,
}

impl Default for RulesSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/etc/hostwall/rules.json"),
            interactive: false,
            prompt_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DpiSection {
    /// Seed HTTP, TLS, SSH and DNS signatures ahead of `signatures`
    pub load_defaults: bool,
    /// Let `BLOCK` signatures drop traffic the rules allowed
    pub enforce_block_signatures: bool,
    pub signatures: Vec<SignatureSpec>,
}

impl Default for DpiSection {
    fn default() -> Self {
        Self {
            load_defaults: true,
            enforce_block_signatures: false,
            signatures: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShaperSection {
    pub enabled: bool,
    pub rate_bytes_per_sec: u64,
    pub max_wait_step_ms: u64,
}

impl Default for ShaperSection {
    fn default() -> Self {
        Self {
            enabled: false,
            rate_bytes_per_sec: 1_250_000, // 10 Mbit/s
            max_wait_step_ms: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EventsSection {
    pub db_path: PathBuf,
    pub queue_size: usize,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/var/lib/hostwall/events.db"),
            queue_size: EventLogConfig::default().queue_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSection {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

impl Config {
    /// Read and validate `path`. `Ok(None)` when the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };

        let config = Self::parse(&content).with_context(|| format!("invalid config {}", path.display()))?;
        Ok(Some(config))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capture.buffer_size == 0 || self.capture.buffer_size > 0xffff {
            bail!("capture.buffer_size must be between 1 and 65535");
        }
        if self.rules.prompt_timeout_secs == 0 {
            bail!("rules.prompt_timeout_secs must be positive");
        }
        if self.shaper.enabled && self.shaper.rate_bytes_per_sec == 0 {
            bail!("shaper.rate_bytes_per_sec must be positive");
        }
        if self.shaper.max_wait_step_ms == 0 {
            bail!("shaper.max_wait_step_ms must be positive");
        }
        if self.events.queue_size == 0 {
            bail!("events.queue_size must be positive");
        }
        if self.logging.level.parse::<tracing::Level>().is_err() {
            bail!("logging.level {:?} is not a log level", self.logging.level);
        }
        for (i, sig) in self.dpi.signatures.iter().enumerate() {
            if sig.name.trim().is_empty() {
                bail!("dpi.signatures[{}].name must not be empty", i);
            }
        }
        Ok(())
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            queue_id: self.capture.queue_id,
            buffer_size: self.capture.buffer_size,
        }
    }

    pub fn rule_engine_config(&self) -> RuleEngineConfig {
        RuleEngineConfig {
            path: Some(self.rules.path.clone()),
            interactive: self.rules.interactive,
            prompt_timeout: Duration::from_secs(self.rules.prompt_timeout_secs),
            ..Default::default()
        }
    }

    pub fn event_log_config(&self) -> EventLogConfig {
        EventLogConfig {
            queue_size: self.events.queue_size,
            ..Default::default()
        }
    }
}
