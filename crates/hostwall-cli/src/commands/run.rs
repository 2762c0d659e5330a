//! Capture loop service

use crate::config::Config;
use anyhow::{Context, Result};
use colored::Colorize;
use hostwall_common::{Action, FiveTuple};
use hostwall_dataplane::{CaptureLoop, QueueOpener};
use hostwall_events::{AsyncEventLog, EventSink, SqliteEventStore};
use hostwall_policy::RuleEngine;
use std::io::BufRead;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

const STATS_INTERVAL: Duration = Duration::from_secs(60);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn handle(config: &Config) -> Result<()> {
    #[cfg(all(feature = "nfqueue", target_os = "linux"))]
    {
        serve(config, hostwall_dataplane::NfqOpener).await
    }

    #[cfg(not(all(feature = "nfqueue", target_os = "linux")))]
    {
        let _ = config;
        anyhow::bail!("this build has no netfilter queue support; rebuild with `--features nfqueue` on Linux")
    }
}

/// Run until Ctrl-C with packets from `opener`
#[cfg_attr(not(all(feature = "nfqueue", target_os = "linux")), allow(dead_code))]
pub async fn serve(config: &Config, opener: impl QueueOpener + 'static) -> Result<()> {
    let rules = Arc::new(super::build_rules(config.rule_engine_config())?);
    let pipeline = Arc::new(super::build_pipeline(config, Arc::clone(&rules), config.capture.link_type)?);
    info!(
        rules = rules.len(),
        stages = ?pipeline.stage_names(),
        link = ?pipeline.link_type(),
        interactive = rules.is_interactive(),
        "Pipeline ready"
    );

    let db_path = &config.events.db_path;
    let store = SqliteEventStore::open(db_path)
        .with_context(|| format!("failed to open event log {}", db_path.display()))?;
    let log = Arc::new(AsyncEventLog::spawn(store, config.event_log_config())?);
    let sink: Arc<dyn EventSink> = Arc::clone(&log) as Arc<dyn EventSink>;

    let capture = Arc::new(CaptureLoop::new(pipeline, sink, opener));
    capture
        .init(config.capture_config())
        .with_context(|| format!("failed to open queue {}", config.capture.queue_id))?;
    capture.start()?;
    info!(queue_id = config.capture.queue_id, "hostwall running, Ctrl-C to stop");

    if rules.is_interactive() {
        spawn_prompter(Arc::clone(&rules))?;
    }

    let mut ticker = tokio::time::interval(STATS_INTERVAL);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let stats = capture.stats();
                let events = log.stats().snapshot();
                info!(
                    total = stats.total,
                    accepted = stats.accepted,
                    dropped = stats.dropped,
                    errors = stats.errors,
                    events_dropped = events.dropped,
                    "Capture stats"
                );
            }
        }
    }

    info!("Shutting down");
    let stopping = Arc::clone(&capture);
    tokio::task::spawn_blocking(move || stopping.stop()).await?;

    if let Err(e) = log.flush(FLUSH_TIMEOUT) {
        warn!(error = %e, "Event log flush failed");
    }
    log.shutdown();

    let stats = capture.stats();
    let events = log.stats().snapshot();
    info!(
        total = stats.total,
        accepted = stats.accepted,
        dropped = stats.dropped,
        errors = stats.errors,
        events_written = events.written,
        events_dropped = events.dropped,
        "Stopped"
    );
    Ok(())
}

/// Operator reply: `a`/`allow`, `b`/`block`, optionally prefixed by a prompt id
#[cfg_attr(not(all(feature = "nfqueue", target_os = "linux")), allow(dead_code))]
pub fn parse_answer(line: &str) -> Option<(Option<u64>, Action)> {
    let mut parts = line.split_whitespace();
    let first = parts.next()?;

    let (id, word) = match first.parse::<u64>() {
        Ok(id) => (Some(id), parts.next()?),
        Err(_) => (None, first),
    };
    if parts.next().is_some() {
        return None;
    }

    let action = match word.to_ascii_lowercase().as_str() {
        "a" => Action::Allow,
        "b" => Action::Block,
        other => other.parse::<Action>().ok()?,
    };
    Some((id, action))
}

/// Operator-facing prompt; answering by id is unambiguous when several wait
#[cfg_attr(not(all(feature = "nfqueue", target_os = "linux")), allow(dead_code))]
fn prompt_line(id: u64, tuple: &FiveTuple) -> String {
    format!(
        "{} #{} {}  answer `{} allow` or `{} block`",
        "Decision needed".yellow().bold(),
        id,
        tuple,
        id,
        id
    )
}

/// Print decision requests and read answers from stdin.
///
/// Plain threads: both block on I/O for the life of the process.
#[cfg_attr(not(all(feature = "nfqueue", target_os = "linux")), allow(dead_code))]
fn spawn_prompter(rules: Arc<RuleEngine>) -> Result<()> {
    let requests = rules.decision_requests();
    let prompts = Arc::clone(&rules);
    thread::Builder::new()
        .name("hostwall-prompts".into())
        .spawn(move || {
            for request in requests.iter() {
                // Timed out while queued behind earlier prompts
                if !prompts.is_prompt_pending(request.id) {
                    continue;
                }
                eprintln!("{}", prompt_line(request.id, &request.tuple));
            }
        })
        .context("failed to start prompt thread")?;

    thread::Builder::new()
        .name("hostwall-answers".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let submitted = match parse_answer(&line) {
                    Some((Some(id), action)) => rules.submit_decision_for(id, action).map(|_| id),
                    Some((None, action)) => rules.submit_decision(action),
                    None => {
                        eprintln!("{} expected `a`, `b`, or `<id> allow|block`", "?".red());
                        continue;
                    }
                };
                match submitted {
                    Ok(id) => eprintln!("{} #{}", "Answered".green(), id),
                    Err(e) => eprintln!("{} {}", "!".red(), e),
                }
            }
        })
        .context("failed to start answer thread")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostwall_dataplane::{CaptureState, ChannelOpener};
    use hostwall_events::NullSink;

    #[test]
    fn test_parse_answer() {
        assert_eq!(parse_answer("a"), Some((None, Action::Allow)));
        assert_eq!(parse_answer(" BLOCK "), Some((None, Action::Block)));
        assert_eq!(parse_answer("7 allow"), Some((Some(7), Action::Allow)));
        assert_eq!(parse_answer("7 drop"), Some((Some(7), Action::Block)));
        assert_eq!(parse_answer("7"), None);
        assert_eq!(parse_answer("maybe"), None);
        assert_eq!(parse_answer("a b"), None);
    }

    #[test]
    fn test_prompt_line_suggests_id_answer() {
        colored::control::set_override(false);
        let tuple = FiveTuple::new(
            "10.0.0.5".parse().unwrap(),
            51000,
            "203.0.113.5".parse().unwrap(),
            22,
            hostwall_common::Protocol::Tcp,
        );
        let line = prompt_line(7, &tuple);
        assert!(line.starts_with("Decision needed #7 10.0.0.5:51000 -> 203.0.113.5:22"));
        assert!(line.ends_with("answer `7 allow` or `7 block`"));
        assert_eq!(parse_answer("7 allow"), Some((Some(7), Action::Allow)));
    }

    #[test]
    fn test_capture_with_configured_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.rules.path = dir.path().join("rules.json");

        let rules = Arc::new(super::super::build_rules(config.rule_engine_config()).unwrap());
        let pipeline = Arc::new(super::super::build_pipeline(&config, rules, config.capture.link_type).unwrap());

        let (opener, handle) = ChannelOpener::new(4);
        let capture = CaptureLoop::new(pipeline, Arc::new(NullSink), opener);
        capture.init(config.capture_config()).unwrap();
        capture.start().unwrap();

        // Not a parseable packet: opaque, no rule, dropped
        let id = handle.inject(vec![0u8; 8]).unwrap();
        let (got, verdict) = handle.recv_verdict(Duration::from_secs(5)).unwrap();
        assert_eq!(got, id);
        assert_eq!(verdict.action(), Action::Block);

        capture.stop();
        assert_eq!(capture.state(), CaptureState::Idle);
        assert_eq!(capture.stats().dropped, 1);
    }
}
