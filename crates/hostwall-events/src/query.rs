//! Event log filters

use chrono::{DateTime, Utc};
use hostwall_common::{Action, LogEntry};
use serde::{Deserialize, Serialize};

/// Filter over recorded events. Results come back newest first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventQuery {
    pub action: Option<Action>,
    pub src_ip: Option<String>,
    pub dst_ip: Option<String>,
    /// Protocol name as logged (`TCP`, `UDP`, `ICMP`, number)
    pub protocol: Option<String>,
    /// Only events at or after this instant
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl EventQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    pub fn src_ip(mut self, ip: impl Into<String>) -> Self {
        self.src_ip = Some(ip.into());
        self
    }

    pub fn dst_ip(mut self, ip: impl Into<String>) -> Self {
        self.dst_ip = Some(ip.into());
        self
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into().to_ascii_uppercase());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check one entry against every populated field
    pub fn matches(&self, entry: &LogEntry) -> bool {
        if self.action.is_some_and(|a| a != entry.action) {
            return false;
        }
        if self.src_ip.as_deref().is_some_and(|ip| ip != entry.src_ip) {
            return false;
        }
        if self.dst_ip.as_deref().is_some_and(|ip| ip != entry.dst_ip) {
            return false;
        }
        if self
            .protocol
            .as_deref()
            .is_some_and(|p| !p.eq_ignore_ascii_case(&entry.protocol))
        {
            return false;
        }
        if self.since.is_some_and(|t| entry.timestamp < t) {
            return false;
        }
        true
    }
}
