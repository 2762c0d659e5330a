//! Non-blocking event sink

use crate::{EventError, EventStore, Result};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use hostwall_common::{AtomicCounter, LogEntry};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Receives one entry per verdict. Must not block.
pub trait EventSink: Send + Sync {
    fn record(&self, entry: LogEntry);
}

/// Discards everything
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn record(&self, _entry: LogEntry) {}
}

/// Event log configuration
#[derive(Clone, Debug)]
pub struct EventLogConfig {
    /// Entries buffered between the capture thread and the writer
    pub queue_size: usize,
    /// Largest batch written in one transaction
    pub batch_size: usize,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            queue_size: 10_000,
            batch_size: 256,
        }
    }
}

/// Sink statistics
#[derive(Debug, Default)]
pub struct SinkStats {
    pub recorded: AtomicCounter,
    pub written: AtomicCounter,
    pub dropped: AtomicCounter,
    pub write_errors: AtomicCounter,
}

/// Plain copy of [`SinkStats`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SinkStatsSnapshot {
    pub recorded: u64,
    pub written: u64,
    pub dropped: u64,
    pub write_errors: u64,
}

impl SinkStats {
    pub fn snapshot(&self) -> SinkStatsSnapshot {
        SinkStatsSnapshot {
            recorded: self.recorded.get(),
            written: self.written.get(),
            dropped: self.dropped.get(),
            write_errors: self.write_errors.get(),
        }
    }
}

enum Message {
    Entry(LogEntry),
    Flush(Sender<()>),
}

/// Queue in front of an [`EventStore`] drained by a writer thread
pub struct AsyncEventLog {
    sender: Mutex<Option<Sender<Message>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<SinkStats>,
}

impl AsyncEventLog {
    /// Start the writer thread over `store`
    pub fn spawn(store: impl EventStore + 'static, config: EventLogConfig) -> Result<Self> {
        let (sender, receiver) = bounded(config.queue_size.max(1));
        let stats = Arc::new(SinkStats::default());

        let writer = {
            let stats = Arc::clone(&stats);
            let batch_size = config.batch_size.max(1);
            thread::Builder::new()
                .name("hostwall-events".into())
                .spawn(move || writer_loop(store, receiver, batch_size, stats))
                .map_err(EventError::Spawn)?
        };

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            writer: Mutex::new(Some(writer)),
            stats,
        })
    }

    /// Wait until everything recorded so far has been written
    pub fn flush(&self, timeout: Duration) -> Result<()> {
        let sender = self.sender.lock().clone().ok_or(EventError::Closed)?;
        let (done_tx, done_rx) = bounded(1);

        sender
            .send_timeout(Message::Flush(done_tx), timeout)
            .map_err(|_| EventError::Closed)?;
        done_rx.recv_timeout(timeout).map_err(|_| EventError::Closed)
    }

    /// Stop accepting entries, write what is queued and join the writer.
    /// Idempotent.
    pub fn shutdown(&self) {
        drop(self.sender.lock().take());

        if let Some(handle) = self.writer.lock().take() {
            if handle.join().is_err() {
                error!("Event writer panicked");
            }
        }
    }

    pub fn stats(&self) -> &SinkStats {
        &self.stats
    }
}

impl EventSink for AsyncEventLog {
    fn record(&self, entry: LogEntry) {
        self.stats.recorded.inc();

        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            self.stats.dropped.inc();
            return;
        };

        match sender.try_send(Message::Entry(entry)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.stats.dropped.inc() + 1;
                // One line per 1000 drops is plenty under sustained overload
                if dropped % 1000 == 1 {
                    warn!(dropped, "Event queue full, dropping log entries");
                }
            }
            Err(TrySendError::Disconnected(_)) => {
                self.stats.dropped.inc();
            }
        }
    }
}

impl Drop for AsyncEventLog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn writer_loop(
    store: impl EventStore,
    receiver: Receiver<Message>,
    batch_size: usize,
    stats: Arc<SinkStats>,
) {
    let mut batch: Vec<LogEntry> = Vec::with_capacity(batch_size);
    let mut waiters: Vec<Sender<()>> = Vec::new();

    loop {
        let first = match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(message) => message,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let mut next = Some(first);
        while let Some(message) = next.take() {
            match message {
                Message::Entry(entry) => batch.push(entry),
                Message::Flush(done) => waiters.push(done),
            }
            if batch.len() >= batch_size {
                break;
            }
            next = receiver.try_recv().ok();
        }

        write_batch(&store, &mut batch, &stats);
        for done in waiters.drain(..) {
            let _ = done.send(());
        }
    }

    // Channel closed: whatever was queued has been received above
    write_batch(&store, &mut batch, &stats);
    debug!("Event writer stopped");
}

fn write_batch(store: &impl EventStore, batch: &mut Vec<LogEntry>, stats: &SinkStats) {
    if batch.is_empty() {
        return;
    }

    match store.append(batch) {
        Ok(()) => {
            stats.written.add(batch.len() as u64);
        }
        Err(e) => {
            stats.write_errors.add(batch.len() as u64);
            error!(error = %e, count = batch.len(), "Failed to write events");
        }
    }
    batch.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventQuery, MemoryEventStore};
    use hostwall_common::{Action, FiveTuple, Protocol};

    fn entry(port: u16) -> LogEntry {
        let tuple = FiveTuple::new(
            "10.0.0.5".parse().unwrap(),
            51000,
            "203.0.113.5".parse().unwrap(),
            port,
            Protocol::Tcp,
        );
        LogEntry::new(&tuple, Action::Block, "default policy")
    }

    #[test]
    fn test_flush_writes_everything() {
        let store = MemoryEventStore::new();
        let log = AsyncEventLog::spawn(store.clone(), EventLogConfig::default()).unwrap();

        for port in 1..=50 {
            log.record(entry(port));
        }
        log.flush(Duration::from_secs(5)).unwrap();

        assert_eq!(store.len(), 50);
        assert_eq!(log.stats().snapshot().written, 50);
        assert_eq!(store.entries()[0].dst_port, 1);
    }

    #[test]
    fn test_shutdown_drains_queue() {
        let store = MemoryEventStore::new();
        let log = AsyncEventLog::spawn(store.clone(), EventLogConfig::default()).unwrap();

        log.record(entry(22));
        log.shutdown();
        log.shutdown();

        assert_eq!(store.query(&EventQuery::new()).unwrap().len(), 1);
        assert!(matches!(log.flush(Duration::from_millis(10)), Err(EventError::Closed)));

        // After shutdown entries are counted as dropped, not queued
        log.record(entry(23));
        assert_eq!(log.stats().snapshot().dropped, 1);
    }

    /// Store that blocks until released, to fill the queue
    struct GatedStore {
        gate: Receiver<()>,
        inner: MemoryEventStore,
    }

    impl EventStore for GatedStore {
        fn append(&self, batch: &[LogEntry]) -> Result<()> {
            let _ = self.gate.recv();
            self.inner.append(batch)
        }

        fn query(&self, query: &EventQuery) -> Result<Vec<LogEntry>> {
            self.inner.query(query)
        }
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let (release, gate) = bounded::<()>(0);
        let inner = MemoryEventStore::new();
        let store = GatedStore {
            gate,
            inner: inner.clone(),
        };
        let log = AsyncEventLog::spawn(
            store,
            EventLogConfig {
                queue_size: 4,
                batch_size: 1,
            },
        )
        .unwrap();

        let start = std::time::Instant::now();
        for port in 0..100 {
            log.record(entry(port));
        }
        assert!(start.elapsed() < Duration::from_secs(1));

        let stats = log.stats().snapshot();
        assert_eq!(stats.recorded, 100);
        assert!(stats.dropped >= 90, "{stats:?}");

        drop(release);
        log.shutdown();
        assert_eq!(inner.len() as u64, 100 - log.stats().snapshot().dropped);
    }
}
