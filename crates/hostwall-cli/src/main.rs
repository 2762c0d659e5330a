//! hostwall CLI
//!
//! Host firewall verdict engine and its operator tooling.
//!
//! # Usage
//!
//! ```bash
//! hostwall run
//! hostwall rules add --dst-port 22 --action block
//! hostwall rules list
//! hostwall signatures test 'GET / HTTP/1.1\r\n'
//! hostwall shape apply --iface eth0 --rate-kbit 10000 --burst-kbit 32 --latency-ms 20
//! hostwall logs query --action block --limit 20
//! hostwall simulate 4500003c...
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hostwall_common::LinkType;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;
mod config;
mod output;

use config::{Config, DEFAULT_CONFIG_PATH};

#[derive(Parser)]
#[command(name = "hostwall")]
#[command(version)]
#[command(about = "Host firewall verdict engine", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, short, env = "HOSTWALL_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Output format
    #[arg(long, short, default_value = "table")]
    format: output::OutputFormat,

    /// Log level, overrides `logging.level`
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the capture loop on the configured netfilter queue
    Run,
    /// Manage the rule file
    Rules {
        #[command(subcommand)]
        action: RuleCommands,
    },
    /// Inspect the DPI signature set
    Signatures {
        #[command(subcommand)]
        action: SignatureCommands,
    },
    /// Interface-wide shaping
    Shape {
        #[command(subcommand)]
        action: ShapeCommands,
    },
    /// Recorded verdicts
    Logs {
        #[command(subcommand)]
        action: LogCommands,
    },
    /// Run one hex-encoded packet through the pipeline
    Simulate {
        /// Packet bytes as hex
        packet: String,
        /// Link-layer framing of the bytes
        #[arg(long)]
        link: Option<LinkType>,
    },
}

#[derive(Subcommand)]
enum RuleCommands {
    /// List rules in evaluation order
    List,
    /// Add a rule (appended unless --index is given)
    Add {
        #[arg(long, default_value = "*")]
        src_ip: String,
        #[arg(long, default_value = "*")]
        dst_ip: String,
        #[arg(long, default_value_t = 0)]
        src_port: u16,
        #[arg(long, default_value_t = 0)]
        dst_port: u16,
        /// TCP, UDP, ICMP, a protocol number, or * for any
        #[arg(long, default_value = "*")]
        protocol: String,
        /// allow, block, drop, deny, log or shape
        #[arg(long)]
        action: String,
        /// Position to insert at, 0 = evaluated first
        #[arg(long)]
        index: Option<usize>,
    },
    /// Remove the rule at an index
    Remove { index: usize },
    /// Remove every rule
    Clear,
}

#[derive(Subcommand)]
enum SignatureCommands {
    /// List signatures in match order
    List,
    /// Classify a payload
    Test {
        /// Payload text; `\xNN`, `\r`, `\n` escapes are decoded
        payload: String,
        /// Treat the payload as hex
        #[arg(long)]
        hex: bool,
    },
}

#[derive(Subcommand)]
enum ShapeCommands {
    /// Apply a rate/burst/latency profile
    Apply {
        #[arg(long)]
        iface: String,
        #[arg(long)]
        rate_kbit: u64,
        #[arg(long)]
        burst_kbit: u64,
        #[arg(long, default_value_t = 0)]
        latency_ms: u32,
        /// Print the tc commands instead of running them
        #[arg(long)]
        dry_run: bool,
    },
    /// Remove shaping from an interface
    Clear {
        #[arg(long)]
        iface: String,
    },
}

#[derive(Subcommand)]
enum LogCommands {
    /// Query recorded verdicts, newest first
    Query {
        #[arg(long)]
        action: Option<String>,
        #[arg(long)]
        src_ip: Option<String>,
        #[arg(long)]
        dst_ip: Option<String>,
        #[arg(long)]
        protocol: Option<String>,
        /// RFC 3339 timestamp
        #[arg(long)]
        since: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = Config::load(&cli.config)?;
    let config = loaded.clone().unwrap_or_default();

    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    init_logging(level, config.logging.json);

    tracing::debug!("hostwall v{}", env!("CARGO_PKG_VERSION"));
    if loaded.is_none() {
        tracing::warn!(path = %cli.config.display(), "Config not found, using defaults");
    }

    let format = cli.format;
    match cli.command {
        Commands::Run => commands::run::handle(&config).await,
        Commands::Rules { action } => commands::rules::handle(action, &config, format),
        Commands::Signatures { action } => commands::signatures::handle(action, &config, format),
        Commands::Shape { action } => commands::shape::handle(action, format).await,
        Commands::Logs { action } => commands::logs::handle(action, &config, format),
        Commands::Simulate { packet, link } => {
            let raw = hex::decode(packet.trim()).context("packet is not valid hex")?;
            commands::simulate::handle(&raw, link, &config, format)
        }
    }
}
