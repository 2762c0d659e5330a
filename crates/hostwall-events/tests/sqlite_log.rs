//! Async log over a SQLite file

use hostwall_common::{Action, FiveTuple, LogEntry, Protocol};
use hostwall_events::{AsyncEventLog, EventLogConfig, EventQuery, EventSink, EventStore, SqliteEventStore};
use std::time::Duration;

#[test]
fn entries_reach_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.db");

    let log = AsyncEventLog::spawn(SqliteEventStore::open(&path).unwrap(), EventLogConfig::default()).unwrap();

    let ssh = FiveTuple::new(
        "10.0.0.5".parse().unwrap(),
        51000,
        "203.0.113.5".parse().unwrap(),
        22,
        Protocol::Tcp,
    );
    log.record(LogEntry::new(&ssh, Action::Block, "rule #0"));

    let mut dns = ssh;
    dns.dst_port = 53;
    dns.protocol = Protocol::Udp;
    log.record(LogEntry::new(&dns, Action::Allow, "rule #1 DNS"));

    log.flush(Duration::from_secs(5)).unwrap();
    log.shutdown();

    let store = SqliteEventStore::open(&path).unwrap();
    let blocked = store.query(&EventQuery::new().action(Action::Block)).unwrap();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].dst_port, 22);
    assert_eq!(blocked[0].action.as_str(), "block");
    assert_eq!(blocked[0].info, "rule #0");

    let udp = store.query(&EventQuery::new().protocol("UDP")).unwrap();
    assert_eq!(udp.len(), 1);
    assert_eq!(udp[0].src_ip, "10.0.0.5");
}
