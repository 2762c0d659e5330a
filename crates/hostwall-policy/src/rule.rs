//! Rule definition and matching

use hostwall_common::{Action, FiveTuple, LegacyAction, Protocol, ValueError};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Address constraint of a rule
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum AddrMatch {
    /// Wildcard (`""`, `"*"`, `0.0.0.0/0`, `::/0`)
    #[default]
    Any,
    /// Single address
    Exact(IpAddr),
    /// Network prefix
    Cidr(IpNetwork),
}

impl AddrMatch {
    /// Check an address; an unknown address only satisfies `Any`
    #[inline]
    pub fn matches(&self, addr: Option<IpAddr>) -> bool {
        match (self, addr) {
            (Self::Any, _) => true,
            (Self::Exact(ip), Some(addr)) => *ip == addr,
            (Self::Cidr(net), Some(addr)) => net.contains(addr),
            (_, None) => false,
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }
}

impl From<Option<IpAddr>> for AddrMatch {
    fn from(addr: Option<IpAddr>) -> Self {
        addr.map(Self::Exact).unwrap_or(Self::Any)
    }
}

impl FromStr for AddrMatch {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == "*" || s.eq_ignore_ascii_case("any") {
            return Ok(Self::Any);
        }

        if s.contains('/') {
            let net: IpNetwork = s.parse().map_err(|_| ValueError::Address(s.to_string()))?;
            return Ok(if net.prefix() == 0 { Self::Any } else { Self::Cidr(net) });
        }

        s.parse::<IpAddr>()
            .map(Self::Exact)
            .map_err(|_| ValueError::Address(s.to_string()))
    }
}

impl fmt::Display for AddrMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Exact(ip) => write!(f, "{}", ip),
            Self::Cidr(net) => write!(f, "{}", net),
        }
    }
}

/// A policy rule. Port `0` and protocol `None` are wildcards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RuleRecord", into = "RuleRecord")]
pub struct Rule {
    pub src_ip: AddrMatch,
    pub dst_ip: AddrMatch,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: Option<Protocol>,
    pub action: Action,
    /// Original keyword when the rule was written as `log` or `shape`
    pub legacy: Option<LegacyAction>,
}

impl Rule {
    /// Rule matching everything
    pub fn new(action: Action) -> Self {
        Self {
            src_ip: AddrMatch::Any,
            dst_ip: AddrMatch::Any,
            src_port: 0,
            dst_port: 0,
            protocol: None,
            action,
            legacy: None,
        }
    }

    /// Rule matching exactly this tuple, as recorded for an operator decision
    pub fn exact(tuple: &FiveTuple, action: Action) -> Self {
        Self {
            src_ip: tuple.src_ip.into(),
            dst_ip: tuple.dst_ip.into(),
            src_port: tuple.src_port,
            dst_port: tuple.dst_port,
            protocol: Some(tuple.protocol),
            action,
            legacy: None,
        }
    }

    pub fn with_src_ip(mut self, addr: AddrMatch) -> Self {
        self.src_ip = addr;
        self
    }

    pub fn with_dst_ip(mut self, addr: AddrMatch) -> Self {
        self.dst_ip = addr;
        self
    }

    pub fn with_src_port(mut self, port: u16) -> Self {
        self.src_port = port;
        self
    }

    pub fn with_dst_port(mut self, port: u16) -> Self {
        self.dst_port = port;
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn with_legacy(mut self, legacy: LegacyAction) -> Self {
        self.action = Action::Allow;
        self.legacy = Some(legacy);
        self
    }

    /// Check if every populated field equals the tuple's
    #[inline]
    pub fn matches(&self, tuple: &FiveTuple) -> bool {
        if !self.src_ip.matches(tuple.src_ip) || !self.dst_ip.matches(tuple.dst_ip) {
            return false;
        }

        if self.src_port != 0 && self.src_port != tuple.src_port {
            return false;
        }

        if self.dst_port != 0 && self.dst_port != tuple.dst_port {
            return false;
        }

        match self.protocol {
            Some(proto) => proto == tuple.protocol,
            None => true,
        }
    }

    /// Keyword written to the rule file
    pub fn action_keyword(&self) -> &'static str {
        match self.legacy {
            Some(legacy) => legacy.as_str(),
            None => self.action.as_str(),
        }
    }
}

fn port_text(port: u16) -> String {
    if port == 0 {
        "*".to_string()
    } else {
        port.to_string()
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} src={}:{} dst={}:{} proto={}",
            self.action_keyword(),
            self.src_ip,
            port_text(self.src_port),
            self.dst_ip,
            port_text(self.dst_port),
            self.protocol.map(|p| p.to_string()).unwrap_or_else(|| "*".into()),
        )
    }
}

// ============================================================================
// File representation
// ============================================================================

/// Ports appear as numbers or as strings in older files
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum PortField {
    Number(u64),
    Text(String),
}

impl Default for PortField {
    fn default() -> Self {
        Self::Number(0)
    }
}

impl TryFrom<PortField> for u16 {
    type Error = ValueError;

    fn try_from(field: PortField) -> Result<Self, Self::Error> {
        match field {
            PortField::Number(n) => u16::try_from(n).map_err(|_| ValueError::Port(n.to_string())),
            PortField::Text(s) => {
                let t = s.trim();
                if t.is_empty() || t == "*" {
                    Ok(0)
                } else {
                    t.parse().map_err(|_| ValueError::Port(s.clone()))
                }
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RuleRecord {
    #[serde(default)]
    src_ip: String,
    #[serde(default)]
    dst_ip: String,
    #[serde(default)]
    src_port: PortField,
    #[serde(default)]
    dst_port: PortField,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    protocol: String,
    action: String,
}

impl TryFrom<RuleRecord> for Rule {
    type Error = ValueError;

    fn try_from(record: RuleRecord) -> Result<Self, Self::Error> {
        let protocol = match record.protocol.trim() {
            "" | "*" => None,
            p if p.eq_ignore_ascii_case("any") => None,
            p => Some(p.parse::<Protocol>()?),
        };

        let (action, legacy) = match LegacyAction::parse(&record.action) {
            Some(legacy) => (Action::Allow, Some(legacy)),
            None => (record.action.parse::<Action>()?, None),
        };

        Ok(Self {
            src_ip: record.src_ip.parse()?,
            dst_ip: record.dst_ip.parse()?,
            src_port: record.src_port.try_into()?,
            dst_port: record.dst_port.try_into()?,
            protocol,
            action,
            legacy,
        })
    }
}

impl From<Rule> for RuleRecord {
    fn from(rule: Rule) -> Self {
        Self {
            src_ip: rule.src_ip.to_string(),
            dst_ip: rule.dst_ip.to_string(),
            src_port: PortField::Number(rule.src_port.into()),
            dst_port: PortField::Number(rule.dst_port.into()),
            protocol: rule.protocol.map(|p| p.to_string()).unwrap_or_default(),
            action: rule.action_keyword().to_string(),
        }
    }
}
