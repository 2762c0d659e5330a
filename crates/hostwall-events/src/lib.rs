//! hostwall Event Log
//!
//! Every verdict produces one [`LogEntry`]. The capture thread hands it to
//! an [`EventSink`], which must return immediately; [`AsyncEventLog`]
//! queues entries and a writer thread persists them in batches to an
//! [`EventStore`] (SQLite on disk, or memory).
//!
//! When the queue is full the entry is dropped and counted. Verdicts never
//! wait on storage.

pub mod query;
pub mod sink;
pub mod store;

pub use hostwall_common::LogEntry;
pub use query::EventQuery;
pub use sink::{AsyncEventLog, EventLogConfig, EventSink, NullSink, SinkStats, SinkStatsSnapshot};
pub use store::{EventStore, MemoryEventStore, SqliteEventStore};

use std::path::PathBuf;
use thiserror::Error;

/// Event log errors
#[derive(Error, Debug)]
pub enum EventError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("failed to prepare {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt event record {id}: {reason}")]
    InvalidRecord { id: i64, reason: String },

    #[error("failed to start event writer: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("event log is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, EventError>;
