//! Rules commands

use crate::{config::Config, output::OutputFormat, RuleCommands};
use anyhow::{Context, Result};
use colored::Colorize;
use hostwall_common::{Action, LegacyAction, Protocol};
use hostwall_policy::{AddrMatch, Rule};
use tabled::Tabled;

#[derive(Tabled)]
struct RuleRow {
    #[tabled(rename = "#")]
    index: usize,
    action: String,
    src: String,
    dst: String,
    protocol: String,
}

fn endpoint(addr: &AddrMatch, port: u16) -> String {
    match port {
        0 => format!("{}:*", addr),
        p => format!("{}:{}", addr, p),
    }
}

fn row(index: usize, rule: &Rule) -> RuleRow {
    RuleRow {
        index,
        action: rule.action_keyword().to_string(),
        src: endpoint(&rule.src_ip, rule.src_port),
        dst: endpoint(&rule.dst_ip, rule.dst_port),
        protocol: rule.protocol.map(|p| p.to_string()).unwrap_or_else(|| "*".into()),
    }
}

/// Rule from command-line fields
pub fn parse_rule(
    src_ip: &str,
    dst_ip: &str,
    src_port: u16,
    dst_port: u16,
    protocol: &str,
    action: &str,
) -> Result<Rule> {
    let (action, legacy) = match LegacyAction::parse(action) {
        Some(legacy) => (Action::Allow, Some(legacy)),
        None => (action.parse::<Action>()?, None),
    };

    let protocol = match protocol.trim() {
        "" | "*" => None,
        p if p.eq_ignore_ascii_case("any") => None,
        p => Some(p.parse::<Protocol>()?),
    };

    let mut rule = Rule::new(action)
        .with_src_ip(src_ip.parse::<AddrMatch>().context("--src-ip")?)
        .with_dst_ip(dst_ip.parse::<AddrMatch>().context("--dst-ip")?)
        .with_src_port(src_port)
        .with_dst_port(dst_port);
    if let Some(protocol) = protocol {
        rule = rule.with_protocol(protocol);
    }
    if let Some(legacy) = legacy {
        rule = rule.with_legacy(legacy);
    }
    Ok(rule)
}

pub fn handle(action: RuleCommands, config: &Config, format: OutputFormat) -> Result<()> {
    // Editing the file never prompts
    let mut engine_config = config.rule_engine_config();
    engine_config.interactive = false;
    let engine = super::build_rules(engine_config)?;
    let path = config.rules.path.display();

    match action {
        RuleCommands::List => {
            format.print_rows(&engine.list_rules(), row);
        }
        RuleCommands::Add {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            protocol,
            action,
            index,
        } => {
            let rule = parse_rule(&src_ip, &dst_ip, src_port, dst_port, &protocol, &action)?;
            let text = rule.to_string();
            let result = match index {
                Some(index) => engine.insert_rule(index, rule),
                None => engine.add_rule(rule),
            };
            result.with_context(|| format!("failed to update {}", path))?;
            println!("{} {}", "Added".green(), text);
        }
        RuleCommands::Remove { index } => {
            let removed = engine
                .remove_rule(index)
                .with_context(|| format!("failed to update {}", path))?;
            println!("{} {}", "Removed".yellow(), removed);
        }
        RuleCommands::Clear => {
            let count = engine.len();
            engine.clear_rules().with_context(|| format!("failed to update {}", path))?;
            println!("{} {} rules", "Cleared".yellow(), count);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostwall_common::FiveTuple;

    #[test]
    fn test_parse_rule() {
        let rule = parse_rule("*", "203.0.113.0/24", 0, 22, "tcp", "DROP").unwrap();
        assert_eq!(rule.action, Action::Block);
        assert_eq!(rule.protocol, Some(Protocol::Tcp));
        assert_eq!(rule.to_string(), "block src=*:* dst=203.0.113.0/24:22 proto=TCP");

        let tuple = FiveTuple::new(
            "10.0.0.5".parse().unwrap(),
            51000,
            "203.0.113.5".parse().unwrap(),
            22,
            Protocol::Tcp,
        );
        assert!(rule.matches(&tuple));
    }

    #[test]
    fn test_parse_legacy_and_errors() {
        let rule = parse_rule("", "", 0, 0, "any", "log").unwrap();
        assert_eq!(rule.action, Action::Allow);
        assert_eq!(rule.action_keyword(), "log");
        assert_eq!(rule.protocol, None);

        assert!(parse_rule("*", "*", 0, 0, "*", "maybe").is_err());
        assert!(parse_rule("not-an-ip", "*", 0, 0, "*", "allow").is_err());
        assert!(parse_rule("*", "*", 0, 0, "sctp", "allow").is_err());
    }

    #[test]
    fn test_rows() {
        let rule = parse_rule("10.0.0.5", "*", 51000, 0, "udp", "allow").unwrap();
        let r = row(3, &rule);
        assert_eq!(r.src, "10.0.0.5:51000");
        assert_eq!(r.dst, "*:*");
        assert_eq!(r.protocol, "UDP");
    }
}
