//! Event log commands

use crate::{config::Config, output::OutputFormat, LogCommands};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use hostwall_common::Action;
use hostwall_events::{EventQuery, EventStore, LogEntry, SqliteEventStore};
use tabled::Tabled;

#[derive(Tabled)]
struct EventRow {
    time: String,
    action: String,
    src: String,
    dst: String,
    protocol: String,
    info: String,
}

fn endpoint(ip: &str, port: u16) -> String {
    match (ip.is_empty(), port) {
        (true, _) => "?".to_string(),
        (false, 0) => ip.to_string(),
        (false, p) if ip.contains(':') => format!("[{}]:{}", ip, p),
        (false, p) => format!("{}:{}", ip, p),
    }
}

fn row(_index: usize, entry: &LogEntry) -> EventRow {
    EventRow {
        time: entry.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        action: entry.action.to_string(),
        src: endpoint(&entry.src_ip, entry.src_port),
        dst: endpoint(&entry.dst_ip, entry.dst_port),
        protocol: entry.protocol.clone(),
        info: entry.info.clone(),
    }
}

/// Query from command-line filters
pub fn build_query(
    action: Option<&str>,
    src_ip: Option<String>,
    dst_ip: Option<String>,
    protocol: Option<String>,
    since: Option<&str>,
    limit: usize,
) -> Result<EventQuery> {
    let mut query = EventQuery::new().limit(limit);

    if let Some(action) = action {
        query = query.action(action.parse::<Action>()?);
    }
    if let Some(ip) = src_ip {
        query = query.src_ip(ip);
    }
    if let Some(ip) = dst_ip {
        query = query.dst_ip(ip);
    }
    if let Some(protocol) = protocol {
        query = query.protocol(protocol);
    }
    if let Some(since) = since {
        let since = DateTime::parse_from_rfc3339(since)
            .with_context(|| format!("--since {:?} is not an RFC 3339 timestamp", since))?;
        query = query.since(since.with_timezone(&Utc));
    }
    Ok(query)
}

pub fn handle(action: LogCommands, config: &Config, format: OutputFormat) -> Result<()> {
    match action {
        LogCommands::Query {
            action,
            src_ip,
            dst_ip,
            protocol,
            since,
            limit,
        } => {
            let query = build_query(action.as_deref(), src_ip, dst_ip, protocol, since.as_deref(), limit)?;
            let path = &config.events.db_path;
            let store = SqliteEventStore::open(path)
                .with_context(|| format!("failed to open event log {}", path.display()))?;

            let entries = store.query(&query)?;
            format.print_rows(&entries, row);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostwall_common::{FiveTuple, Protocol};

    #[test]
    fn test_build_query() {
        let query = build_query(
            Some("DROP"),
            Some("10.0.0.5".into()),
            None,
            Some("TCP".into()),
            Some("2024-01-01T00:00:00+02:00"),
            10,
        )
        .unwrap();

        assert_eq!(query.action, Some(Action::Block));
        assert_eq!(query.src_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(query.dst_ip, None);
        assert_eq!(query.limit, Some(10));
        assert_eq!(
            query.since.map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)).as_deref(),
            Some("2023-12-31T22:00:00Z")
        );

        assert!(build_query(Some("maybe"), None, None, None, None, 1).is_err());
        assert!(build_query(None, None, None, None, Some("yesterday"), 1).is_err());
    }

    #[test]
    fn test_query_against_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteEventStore::open(dir.path().join("events.db")).unwrap();

        let tuple = FiveTuple::new(
            "10.0.0.5".parse().unwrap(),
            51000,
            "203.0.113.5".parse().unwrap(),
            22,
            Protocol::Tcp,
        );
        store
            .append(&[
                LogEntry::new(&tuple, Action::Block, "rule #0"),
                LogEntry::new(&tuple, Action::Allow, "rule #1"),
            ])
            .unwrap();

        let query = build_query(Some("block"), None, None, None, None, 50).unwrap();
        let entries = store.query(&query).unwrap();
        assert_eq!(entries.len(), 1);

        let r = row(0, &entries[0]);
        assert_eq!(r.src, "10.0.0.5:51000");
        assert_eq!(r.dst, "203.0.113.5:22");
        assert_eq!(r.info, "rule #0");
    }

    #[test]
    fn test_endpoint() {
        assert_eq!(endpoint("", 0), "?");
        assert_eq!(endpoint("10.0.0.1", 0), "10.0.0.1");
        assert_eq!(endpoint("2001:db8::1", 443), "[2001:db8::1]:443");
    }
}
