//! Decision log entries

use crate::{Action, FiveTuple};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One recorded verdict. Immutable once handed to a sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the verdict was issued
    pub timestamp: DateTime<Utc>,
    /// Source address, empty when unknown
    pub src_ip: String,
    /// Source port
    pub src_port: u16,
    /// Destination address, empty when unknown
    pub dst_ip: String,
    /// Destination port
    pub dst_port: u16,
    /// Protocol name (`TCP`, `UDP`, `ICMP` or a number)
    pub protocol: String,
    /// Action taken
    pub action: Action,
    /// Matched rule or signature, free text
    pub info: String,
}

impl LogEntry {
    /// Create entry for a tuple, stamped now
    pub fn new(tuple: &FiveTuple, action: Action, info: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            src_ip: tuple.src_ip_string(),
            src_port: tuple.src_port,
            dst_ip: tuple.dst_ip_string(),
            dst_port: tuple.dst_port,
            protocol: tuple.protocol.to_string(),
            action,
            info: info.into(),
        }
    }

    /// Override the timestamp
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}
