//! Verdict Pipeline
//!
//! Extract → Rules → DPI → Shape, each stage a [`Stage`] so callers swap a
//! stage instead of replacing the whole verdict logic.
//!
//! A packet that leaves the last stage with `Continue` gets the verdict of
//! `ctx.action`, which starts out as Block. An empty pipeline therefore
//! drops everything.

use crate::parse::extract;
use hostwall_common::{Action, FiveTuple, LinkType, LogEntry, PacketView, Verdict};
use hostwall_dpi::{Classification, Inspection, SignatureEngine};
use hostwall_policy::{Decision, RuleEngine};
use hostwall_shaper::{Admission, TokenBucket};
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::debug;

/// Pipeline stage result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageResult {
    /// Continue to next stage
    Continue,
    /// Accept now, skip the remaining stages
    Accept,
    /// Drop now, skip the remaining stages
    Drop,
}

/// Per-packet state threaded through the stages
#[derive(Debug)]
pub struct PacketContext<'a> {
    pub view: PacketView<'a>,
    pub tuple: FiveTuple,
    /// Action the packet currently stands at
    pub action: Action,
    pub decision: Option<Decision>,
    pub inspection: Option<Inspection>,
    pub admission: Option<Admission>,
}

impl<'a> PacketContext<'a> {
    pub fn new(view: PacketView<'a>) -> Self {
        Self {
            tuple: view.five_tuple(),
            view,
            action: Action::Block,
            decision: None,
            inspection: None,
            admission: None,
        }
    }
}

/// Pipeline stage trait
pub trait Stage: Send + Sync {
    fn process(&self, ctx: &mut PacketContext<'_>) -> StageResult;
    fn name(&self) -> &'static str;
}

// ============================================================================
// Stages
// ============================================================================

/// Asks the rule engine. May block on an interactive prompt.
pub struct RuleStage {
    engine: Arc<RuleEngine>,
}

impl RuleStage {
    pub fn new(engine: Arc<RuleEngine>) -> Self {
        Self { engine }
    }
}

impl Stage for RuleStage {
    fn process(&self, ctx: &mut PacketContext<'_>) -> StageResult {
        let decision = self.engine.decide(&ctx.tuple);
        ctx.action = decision.action;
        ctx.decision = Some(decision);

        match decision.action {
            Action::Allow => StageResult::Continue,
            Action::Block => StageResult::Drop,
        }
    }

    fn name(&self) -> &'static str {
        "rules"
    }
}

/// Classifies the payload.
///
/// Classification never overrides the rule engine unless `enforce` is set,
/// in which case a signature with result `Block` drops the packet.
pub struct DpiStage {
    engine: Arc<SignatureEngine>,
    enforce: bool,
}

impl DpiStage {
    pub fn new(engine: Arc<SignatureEngine>) -> Self {
        Self { engine, enforce: false }
    }

    pub fn enforcing(mut self, enforce: bool) -> Self {
        self.enforce = enforce;
        self
    }
}

impl Stage for DpiStage {
    fn process(&self, ctx: &mut PacketContext<'_>) -> StageResult {
        let inspection = self.engine.inspect(ctx.view.payload());
        let block = self.enforce && inspection.classification == Classification::Block;
        ctx.inspection = Some(inspection);

        if block {
            ctx.action = Action::Block;
            StageResult::Drop
        } else {
            StageResult::Continue
        }
    }

    fn name(&self) -> &'static str {
        "dpi"
    }
}

/// Token-bucket admission. Blocks the capture thread while waiting.
pub struct ShapeStage {
    bucket: Arc<TokenBucket>,
}

impl ShapeStage {
    pub fn new(bucket: Arc<TokenBucket>) -> Self {
        Self { bucket }
    }
}

impl Stage for ShapeStage {
    fn process(&self, ctx: &mut PacketContext<'_>) -> StageResult {
        ctx.admission = Some(self.bucket.admit(ctx.view.length));
        StageResult::Continue
    }

    fn name(&self) -> &'static str {
        "shape"
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Outcome of one packet
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub verdict: Verdict,
    pub tuple: FiveTuple,
    pub length: usize,
    pub decision: Option<Decision>,
    pub inspection: Option<Inspection>,
    pub admission: Option<Admission>,
    /// Stage that ended evaluation early
    pub stopped_by: Option<&'static str>,
}

impl Evaluation {
    /// Free-text reason: rule id, signature, early stop
    pub fn info(&self) -> String {
        let mut info = match &self.decision {
            Some(decision) => decision.to_string(),
            None => String::new(),
        };

        if let Some(Inspection {
            classification,
            matched: Some(name),
        }) = &self.inspection
        {
            if !info.is_empty() {
                info.push(' ');
            }
            let _ = write!(info, "sig={} ({})", name, classification.as_str());
        }

        if let Some(stage) = self.stopped_by.filter(|s| *s != "rules") {
            if !info.is_empty() {
                info.push(' ');
            }
            let _ = write!(info, "[{} {}]", stage, self.verdict.action());
        }

        if info.is_empty() {
            info.push_str("no decision");
        }
        info
    }

    pub fn log_entry(&self) -> LogEntry {
        LogEntry::new(&self.tuple, self.verdict.action(), self.info())
    }
}

/// Ordered stages behind one `evaluate` call
pub struct Pipeline {
    link: LinkType,
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    pub fn new(link: LinkType) -> Self {
        Self {
            link,
            stages: Vec::new(),
        }
    }

    /// Rules, then DPI, then optional shaping
    pub fn standard(
        link: LinkType,
        rules: Arc<RuleEngine>,
        signatures: Arc<SignatureEngine>,
        bucket: Option<Arc<TokenBucket>>,
        enforce_block_signatures: bool,
    ) -> Self {
        let mut p = Self::new(link);
        p.add_stage(Box::new(RuleStage::new(rules)));
        p.add_stage(Box::new(DpiStage::new(signatures).enforcing(enforce_block_signatures)));
        if let Some(bucket) = bucket {
            p.add_stage(Box::new(ShapeStage::new(bucket)));
        }
        p
    }

    pub fn add_stage(&mut self, stage: Box<dyn Stage>) {
        self.stages.push(stage);
    }

    pub fn link_type(&self) -> LinkType {
        self.link
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run one captured buffer through every stage
    pub fn evaluate(&self, raw: &[u8]) -> Evaluation {
        let mut ctx = PacketContext::new(extract(raw, self.link));
        let mut stopped_by = None;

        for stage in &self.stages {
            match stage.process(&mut ctx) {
                StageResult::Continue => continue,
                StageResult::Accept => {
                    ctx.action = Action::Allow;
                    stopped_by = Some(stage.name());
                    break;
                }
                StageResult::Drop => {
                    ctx.action = Action::Block;
                    stopped_by = Some(stage.name());
                    break;
                }
            }
        }

        let verdict = Verdict::from(ctx.action);
        debug!(
            tuple = %ctx.tuple,
            verdict = ?verdict,
            stage = stopped_by.unwrap_or("-"),
            "Packet evaluated"
        );

        Evaluation {
            verdict,
            tuple: ctx.tuple,
            length: ctx.view.length,
            decision: ctx.decision,
            inspection: ctx.inspection,
            admission: ctx.admission,
            stopped_by,
        }
    }
}
