//! Shaping commands

use crate::{output::OutputFormat, ShapeCommands};
use anyhow::{Context, Result};
use async_trait::async_trait;
use colored::Colorize;
use hostwall_shaper::{CommandOutput, CommandRunner, InterfaceShaper, Preflight, ShapeProfile};
use serde::Serialize;

/// Succeeds without running anything
struct DryRun;

#[async_trait]
impl CommandRunner for DryRun {
    async fn run(&self, _program: &str, _args: &[String]) -> std::io::Result<CommandOutput> {
        Ok(CommandOutput {
            success: true,
            ..Default::default()
        })
    }
}

impl Preflight for DryRun {
    fn interface_exists(&self, _iface: &str) -> bool {
        true
    }

    fn is_privileged(&self) -> bool {
        true
    }
}

#[derive(Debug, Serialize)]
struct ApplyReport<'a> {
    iface: &'a str,
    profile: ShapeProfile,
    dry_run: bool,
    commands: Vec<String>,
}

fn shaper(dry_run: bool) -> InterfaceShaper {
    if dry_run {
        InterfaceShaper::with_backends(DryRun, DryRun)
    } else {
        InterfaceShaper::new()
    }
}

pub async fn handle(action: ShapeCommands, format: OutputFormat) -> Result<()> {
    match action {
        ShapeCommands::Apply {
            iface,
            rate_kbit,
            burst_kbit,
            latency_ms,
            dry_run,
        } => {
            let profile = ShapeProfile {
                rate_kbit,
                burst_kbit,
                latency_ms,
            };
            let commands = shaper(dry_run)
                .apply(&iface, &profile)
                .await
                .with_context(|| format!("failed to shape {}", iface))?;

            let report = ApplyReport {
                iface: &iface,
                profile,
                dry_run,
                commands,
            };
            format.print_value(&report, || {
                let mut text = if dry_run {
                    format!("{} {}", "Would run on".cyan(), iface)
                } else {
                    format!("{} {}", "Shaped".green(), iface)
                };
                for command in &report.commands {
                    text.push_str("\n  ");
                    text.push_str(command);
                }
                text
            });
        }
        ShapeCommands::Clear { iface } => {
            InterfaceShaper::new()
                .clear(&iface)
                .await
                .with_context(|| format!("failed to clear shaping on {}", iface))?;
            println!("{} {}", "Cleared".yellow(), iface);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn plan(iface: &str, profile: &ShapeProfile) -> Result<Vec<String>> {
        Ok(shaper(true).apply(iface, profile).await?)
    }

    #[tokio::test]
    async fn test_plan_lists_every_step() {
        let profile = ShapeProfile {
            rate_kbit: 10_000,
            burst_kbit: 32,
            latency_ms: 20,
        };
        let commands = plan("eth0", &profile).await.unwrap();
        assert_eq!(
            commands,
            vec![
                "tc qdisc del dev eth0 root",
                "tc qdisc add dev eth0 root handle 1: htb default 10",
                "tc class add dev eth0 parent 1: classid 1:10 htb rate 10000kbit burst 32kbit",
                "tc qdisc add dev eth0 parent 1:10 handle 10: netem delay 20ms",
            ]
        );
    }

    #[tokio::test]
    async fn test_plan_still_validates() {
        let zero_rate = ShapeProfile {
            rate_kbit: 0,
            burst_kbit: 32,
            latency_ms: 0,
        };
        assert!(plan("eth0", &zero_rate).await.is_err());

        let profile = ShapeProfile {
            rate_kbit: 1,
            burst_kbit: 1,
            latency_ms: 0,
        };
        assert!(plan("not/an/iface", &profile).await.is_err());
    }
}
