//! Rule engine with interactive fallback

use crate::prompt::{DecisionRequest, PromptBroker};
use crate::{PolicyError, Result, Rule, RuleStore};
use crossbeam_channel::Receiver;
use hostwall_common::{Action, AtomicCounter, FiveTuple, LegacyAction};
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info};

/// Default wait for an operator answer
pub const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Rule engine configuration
#[derive(Clone, Debug)]
pub struct RuleEngineConfig {
    /// Backing rule file; `None` keeps rules in memory only
    pub path: Option<PathBuf>,
    /// Ask the operator when nothing matches
    pub interactive: bool,
    /// How long an unmatched packet waits for an answer
    pub prompt_timeout: Duration,
    /// Buffered decision notifications
    pub request_queue: usize,
}

impl Default for RuleEngineConfig {
    fn default() -> Self {
        Self {
            path: None,
            interactive: false,
            prompt_timeout: DEFAULT_PROMPT_TIMEOUT,
            request_queue: 64,
        }
    }
}

/// Why a decision was reached
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    /// Rule at this index matched
    Rule(usize),
    /// Nothing matched, fail closed
    Default,
    /// Operator answered a prompt
    Operator,
    /// Prompt went unanswered
    Timeout,
}

/// Result of [`RuleEngine::decide`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub action: Action,
    pub reason: DecisionReason,
    /// Legacy keyword of the matching rule, if any
    pub legacy: Option<LegacyAction>,
}

impl Decision {
    fn new(action: Action, reason: DecisionReason) -> Self {
        Self {
            action,
            reason,
            legacy: None,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason {
            DecisionReason::Rule(index) => write!(f, "rule #{}", index)?,
            DecisionReason::Default => f.write_str("default policy")?,
            DecisionReason::Operator => f.write_str("operator decision")?,
            DecisionReason::Timeout => f.write_str("prompt timeout")?,
        }
        if let Some(legacy) = self.legacy {
            write!(f, " ({})", legacy.as_str())?;
        }
        Ok(())
    }
}

/// Rule engine statistics
#[derive(Default)]
pub struct RuleStats {
    pub decisions: AtomicCounter,
    pub rule_hits: AtomicCounter,
    pub default_blocks: AtomicCounter,
    pub prompts: AtomicCounter,
    pub prompt_timeouts: AtomicCounter,
}

/// Ordered 5-tuple rule engine
pub struct RuleEngine {
    rules: RwLock<Vec<Rule>>,
    store: Option<RuleStore>,
    interactive: AtomicBool,
    prompt_timeout_ms: AtomicU64,
    prompts: PromptBroker,
    stats: RuleStats,
}

impl RuleEngine {
    /// In-memory engine, interactive mode off
    pub fn new() -> Self {
        Self::with_config(RuleEngineConfig::default())
    }

    /// Build engine without touching the filesystem
    pub fn with_config(config: RuleEngineConfig) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            store: config.path.map(RuleStore::new),
            interactive: AtomicBool::new(config.interactive),
            prompt_timeout_ms: AtomicU64::new(duration_ms(config.prompt_timeout)),
            prompts: PromptBroker::new(config.request_queue),
            stats: RuleStats::default(),
        }
    }

    /// Build engine and load its backing file. A missing file starts empty.
    pub fn open(config: RuleEngineConfig) -> Result<Self> {
        let engine = Self::with_config(config);
        if let Some(store) = &engine.store {
            if store.exists() {
                *engine.rules.write() = store.load()?;
            } else {
                info!(path = %store.path().display(), "Rule file not found, starting empty");
            }
        }
        Ok(engine)
    }

    // ========================================================================
    // Evaluation
    // ========================================================================

    /// Decide a packet.
    ///
    /// First matching rule wins. With nothing matching, interactive mode
    /// blocks this thread until an operator answers or the prompt times
    /// out; otherwise the result is Block.
    pub fn decide(&self, tuple: &FiveTuple) -> Decision {
        self.stats.decisions.inc();

        if let Some(decision) = self.match_rules(tuple) {
            self.stats.rule_hits.inc();
            debug!(tuple = %tuple, decision = %decision, action = %decision.action, "Rule matched");
            return decision;
        }

        if !self.is_interactive() {
            self.stats.default_blocks.inc();
            return Decision::new(Action::Block, DecisionReason::Default);
        }

        self.stats.prompts.inc();
        match self.prompts.ask(tuple, self.prompt_timeout()) {
            Some(action) => {
                let rule = Rule::exact(tuple, action);
                info!(rule = %rule, "Operator decision recorded");
                if let Err(e) = self.insert_rule(0, rule) {
                    error!(error = %e, tuple = %tuple, "Failed to persist operator decision");
                }
                Decision::new(action, DecisionReason::Operator)
            }
            None => {
                self.stats.prompt_timeouts.inc();
                debug!(tuple = %tuple, "Prompt timed out");
                Decision::new(Action::Block, DecisionReason::Timeout)
            }
        }
    }

    /// Rule lookup only, never prompts
    pub fn match_rules(&self, tuple: &FiveTuple) -> Option<Decision> {
        let rules = self.rules.read();
        rules.iter().enumerate().find(|(_, r)| r.matches(tuple)).map(|(index, rule)| Decision {
            action: rule.action,
            reason: DecisionReason::Rule(index),
            legacy: rule.legacy,
        })
    }

    // ========================================================================
    // Interactive mode
    // ========================================================================

    pub fn set_interactive_mode(&self, enabled: bool) {
        self.interactive.store(enabled, Ordering::Relaxed);
        info!(enabled, "Interactive mode changed");
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive.load(Ordering::Relaxed)
    }

    pub fn set_prompt_timeout(&self, timeout: Duration) {
        self.prompt_timeout_ms.store(duration_ms(timeout), Ordering::Relaxed);
    }

    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_millis(self.prompt_timeout_ms.load(Ordering::Relaxed))
    }

    /// "Decision needed" notifications
    pub fn decision_requests(&self) -> Receiver<DecisionRequest> {
        self.prompts.requests()
    }

    /// Answer the oldest pending prompt; returns its id
    pub fn submit_decision(&self, action: Action) -> Result<u64> {
        self.prompts.submit(action).ok_or(PolicyError::NoPendingPrompt)
    }

    /// Answer one prompt by id
    pub fn submit_decision_for(&self, id: u64, action: Action) -> Result<()> {
        if self.prompts.submit_for(id, action) {
            Ok(())
        } else {
            Err(PolicyError::NoPendingPrompt)
        }
    }

    pub fn pending_prompts(&self) -> usize {
        self.prompts.pending()
    }

    /// False once prompt `id` was answered or timed out
    pub fn is_prompt_pending(&self, id: u64) -> bool {
        self.prompts.is_pending(id)
    }

    // ========================================================================
    // Mutation
    // ========================================================================

    /// Append a rule at the end of the evaluation order
    pub fn add_rule(&self, rule: Rule) -> Result<()> {
        self.mutate(|rules| {
            rules.push(rule);
            Ok(())
        })
    }

    /// Insert a rule at `index` (0 takes precedence over everything)
    pub fn insert_rule(&self, index: usize, rule: Rule) -> Result<()> {
        self.mutate(|rules| {
            if index > rules.len() {
                return Err(PolicyError::IndexOutOfRange {
                    index,
                    len: rules.len(),
                });
            }
            rules.insert(index, rule);
            Ok(())
        })
    }

    /// Remove the rule at `index`
    pub fn remove_rule(&self, index: usize) -> Result<Rule> {
        self.mutate(|rules| {
            if index >= rules.len() {
                return Err(PolicyError::IndexOutOfRange {
                    index,
                    len: rules.len(),
                });
            }
            Ok(rules.remove(index))
        })
    }

    pub fn clear_rules(&self) -> Result<()> {
        self.mutate(|rules| {
            rules.clear();
            Ok(())
        })
    }

    /// Rules in evaluation order
    pub fn list_rules(&self) -> Vec<Rule> {
        self.rules.read().clone()
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }

    /// Replace the rule list from a file. Nothing changes on error.
    pub fn load_rules(&self, path: impl AsRef<Path>) -> Result<usize> {
        let loaded = RuleStore::new(path.as_ref()).load()?;
        let count = loaded.len();
        *self.rules.write() = loaded;
        Ok(count)
    }

    /// Write the current rule list to a file
    pub fn save_rules(&self, path: impl AsRef<Path>) -> Result<()> {
        let rules = self.rules.read();
        RuleStore::new(path.as_ref()).save(&rules)
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.store.as_ref().map(RuleStore::path)
    }

    pub fn stats(&self) -> &RuleStats {
        &self.stats
    }

    /// Apply `f` to a copy, persist the copy, then publish it
    fn mutate<T>(&self, f: impl FnOnce(&mut Vec<Rule>) -> Result<T>) -> Result<T> {
        let mut rules = self.rules.write();
        let mut next = rules.clone();
        let out = f(&mut next)?;

        if let Some(store) = &self.store {
            store.save(&next)?;
        }

        *rules = next;
        Ok(out)
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostwall_common::Protocol;
    use std::sync::Arc;
    use std::thread;

    fn ssh_attempt() -> FiveTuple {
        FiveTuple::new(
            "10.0.0.5".parse().unwrap(),
            51000,
            "203.0.113.5".parse().unwrap(),
            22,
            Protocol::Tcp,
        )
    }

    #[test]
    fn test_empty_engine_fails_closed() {
        let engine = RuleEngine::new();
        let decision = engine.decide(&ssh_attempt());
        assert_eq!(decision.action, Action::Block);
        assert_eq!(decision.reason, DecisionReason::Default);
    }

    #[test]
    fn test_first_rule_wins() {
        let engine = RuleEngine::new();
        engine.add_rule(Rule::new(Action::Allow).with_dst_port(22)).unwrap();
        engine.add_rule(Rule::new(Action::Block).with_dst_port(22)).unwrap();

        let decision = engine.decide(&ssh_attempt());
        assert_eq!(decision.action, Action::Allow);
        assert_eq!(decision.reason, DecisionReason::Rule(0));
        assert_eq!(decision.to_string(), "rule #0");
    }

    #[test]
    fn test_insert_and_remove() {
        let engine = RuleEngine::new();
        engine.add_rule(Rule::new(Action::Block)).unwrap();
        engine.insert_rule(0, Rule::new(Action::Allow).with_dst_port(22)).unwrap();
        assert_eq!(engine.decide(&ssh_attempt()).action, Action::Allow);

        assert!(matches!(
            engine.insert_rule(5, Rule::new(Action::Allow)),
            Err(PolicyError::IndexOutOfRange { index: 5, len: 2 })
        ));

        let removed = engine.remove_rule(0).unwrap();
        assert_eq!(removed.dst_port, 22);
        assert_eq!(engine.decide(&ssh_attempt()).action, Action::Block);
        assert!(engine.remove_rule(3).is_err());

        engine.clear_rules().unwrap();
        assert!(engine.is_empty());
    }

    #[test]
    fn test_mutations_persist() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        let engine = RuleEngine::open(RuleEngineConfig {
            path: Some(path.clone()),
            ..Default::default()
        })
        .unwrap();

        engine.add_rule(Rule::new(Action::Block).with_dst_port(22)).unwrap();
        engine.add_rule(Rule::new(Action::Allow).with_dst_port(443)).unwrap();
        engine.remove_rule(0).unwrap();

        let reopened = RuleEngine::open(RuleEngineConfig {
            path: Some(path),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(reopened.list_rules(), engine.list_rules());
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.list_rules()[0].dst_port, 443);
    }

    #[test]
    fn test_failed_persist_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the rule file should be makes every save fail
        let path = dir.path().join("rules.json");
        std::fs::create_dir(&path).unwrap();

        let engine = RuleEngine::with_config(RuleEngineConfig {
            path: Some(path),
            ..Default::default()
        });
        assert!(matches!(
            engine.add_rule(Rule::new(Action::Allow)),
            Err(PolicyError::Io { .. })
        ));
        assert!(engine.is_empty());
    }

    #[test]
    fn test_load_error_keeps_rules() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, r#"[{"action": "explode"}]"#).unwrap();

        let engine = RuleEngine::new();
        engine.add_rule(Rule::new(Action::Allow)).unwrap();
        assert!(matches!(engine.load_rules(&bad), Err(PolicyError::Parse { .. })));
        assert!(matches!(
            engine.load_rules(dir.path().join("missing.json")),
            Err(PolicyError::Io { .. })
        ));
        assert_eq!(engine.len(), 1);
    }

    #[test]
    fn test_interactive_timeout_blocks() {
        let engine = RuleEngine::with_config(RuleEngineConfig {
            interactive: true,
            prompt_timeout: Duration::from_millis(30),
            ..Default::default()
        });

        let decision = engine.decide(&ssh_attempt());
        assert_eq!(decision.action, Action::Block);
        assert_eq!(decision.reason, DecisionReason::Timeout);
        assert!(engine.is_empty());
        assert_eq!(engine.pending_prompts(), 0);
    }

    #[test]
    fn test_interactive_decision_inserted_first() {
        let engine = Arc::new(RuleEngine::with_config(RuleEngineConfig {
            interactive: true,
            prompt_timeout: Duration::from_secs(5),
            ..Default::default()
        }));
        engine.add_rule(Rule::new(Action::Block).with_dst_port(80)).unwrap();
        let requests = engine.decision_requests();

        let worker = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.decide(&ssh_attempt()))
        };

        let request = requests.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(request.tuple.dst_port, 22);

        // The rule list stays usable while the prompt is open
        assert_eq!(engine.len(), 1);

        engine.submit_decision(Action::Allow).unwrap();
        let decision = worker.join().unwrap();
        assert_eq!(decision.action, Action::Allow);
        assert_eq!(decision.reason, DecisionReason::Operator);

        let rules = engine.list_rules();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0], Rule::exact(&ssh_attempt(), Action::Allow));

        // Now answered by the recorded rule, no prompt
        let again = engine.decide(&ssh_attempt());
        assert_eq!(again.reason, DecisionReason::Rule(0));
    }

    #[test]
    fn test_submit_without_prompt() {
        let engine = RuleEngine::new();
        assert!(matches!(
            engine.submit_decision(Action::Allow),
            Err(PolicyError::NoPendingPrompt)
        ));
    }
}
