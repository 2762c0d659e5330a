//! Durable event storage

use crate::{EventError, EventQuery, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use hostwall_common::{Action, LogEntry};
use parking_lot::Mutex;
use rusqlite::types::ToSql;
use rusqlite::{params, params_from_iter, Connection};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Append-only event storage
pub trait EventStore: Send {
    /// Persist a batch in order
    fn append(&self, batch: &[LogEntry]) -> Result<()>;

    /// Events matching `query`, newest first
    fn query(&self, query: &EventQuery) -> Result<Vec<LogEntry>>;
}

// ============================================================================
// SQLite
// ============================================================================

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        src_ip TEXT NOT NULL,
        src_port INTEGER NOT NULL,
        dst_ip TEXT NOT NULL,
        dst_port INTEGER NOT NULL,
        protocol TEXT NOT NULL,
        action TEXT NOT NULL,
        info TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
    CREATE INDEX IF NOT EXISTS idx_events_src_ip ON events(src_ip);
"#;

const INSERT: &str = r#"INSERT INTO events (timestamp, src_ip, src_port, dst_ip, dst_port, protocol, action, info)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#;

/// SQLite-backed store, table `events`
pub struct SqliteEventStore {
    conn: Connection,
}

impl SqliteEventStore {
    /// Open or create the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| EventError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let store = Self::init(conn)?;

        info!(path = %path.display(), "Event store opened");
        Ok(store)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Number of stored events
    pub fn count(&self) -> Result<u64> {
        let n: i64 = self.conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }
}

fn format_timestamp(ts: &DateTime<Utc>) -> String {
    // Fixed width so text order is time order
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl EventStore for SqliteEventStore {
    fn append(&self, batch: &[LogEntry]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare_cached(INSERT)?;
            for entry in batch {
                stmt.execute(params![
                    format_timestamp(&entry.timestamp),
                    entry.src_ip,
                    entry.src_port,
                    entry.dst_ip,
                    entry.dst_port,
                    entry.protocol,
                    entry.action.as_str(),
                    entry.info,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn query(&self, query: &EventQuery) -> Result<Vec<LogEntry>> {
        let mut sql = String::from(
            "SELECT id, timestamp, src_ip, src_port, dst_ip, dst_port, protocol, action, info FROM events",
        );
        let mut clauses: Vec<&str> = Vec::new();
        let mut args: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(action) = query.action {
            clauses.push("action = ?");
            args.push(Box::new(action.as_str()));
        }
        if let Some(ip) = &query.src_ip {
            clauses.push("src_ip = ?");
            args.push(Box::new(ip.clone()));
        }
        if let Some(ip) = &query.dst_ip {
            clauses.push("dst_ip = ?");
            args.push(Box::new(ip.clone()));
        }
        if let Some(protocol) = &query.protocol {
            clauses.push("protocol = ? COLLATE NOCASE");
            args.push(Box::new(protocol.clone()));
        }
        if let Some(since) = &query.since {
            clauses.push("timestamp >= ?");
            args.push(Box::new(format_timestamp(since)));
        }

        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY timestamp DESC, id DESC");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u16>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, u16>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, timestamp, src_ip, src_port, dst_ip, dst_port, protocol, action, info) = row?;

            let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                .map_err(|e| EventError::InvalidRecord {
                    id,
                    reason: format!("timestamp {timestamp:?}: {e}"),
                })?
                .with_timezone(&Utc);
            let action: Action = action.parse().map_err(|e| EventError::InvalidRecord {
                id,
                reason: format!("{e}"),
            })?;

            entries.push(LogEntry {
                timestamp,
                src_ip,
                src_port,
                dst_ip,
                dst_port,
                protocol,
                action,
                info,
            });
        }

        Ok(entries)
    }
}

// ============================================================================
// Memory
// ============================================================================

/// In-memory store; clones share the same entries
#[derive(Clone, Default)]
pub struct MemoryEventStore {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything stored, oldest first
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl EventStore for MemoryEventStore {
    fn append(&self, batch: &[LogEntry]) -> Result<()> {
        self.entries.lock().extend_from_slice(batch);
        Ok(())
    }

    fn query(&self, query: &EventQuery) -> Result<Vec<LogEntry>> {
        let entries = self.entries.lock();
        let mut found: Vec<LogEntry> = entries.iter().rev().filter(|e| query.matches(e)).cloned().collect();
        // Stable sort keeps insertion order among equal timestamps
        found.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = query.limit {
            found.truncate(limit);
        }
        Ok(found)
    }
}
