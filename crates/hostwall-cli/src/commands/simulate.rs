//! Offline verdict for one packet

use crate::{config::Config, output::OutputFormat};
use anyhow::Result;
use colored::Colorize;
use hostwall_common::{FiveTuple, LinkType, Verdict};
use hostwall_dataplane::Pipeline;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub verdict: Verdict,
    pub tuple: FiveTuple,
    pub length: usize,
    pub classification: Option<String>,
    pub stopped_by: Option<&'static str>,
    pub info: String,
}

pub fn simulate(pipeline: &Pipeline, raw: &[u8]) -> SimulationReport {
    let eval = pipeline.evaluate(raw);
    SimulationReport {
        verdict: eval.verdict,
        tuple: eval.tuple,
        length: eval.length,
        classification: eval.inspection.as_ref().map(|i| i.classification.to_string()),
        stopped_by: eval.stopped_by,
        info: eval.info(),
    }
}

pub fn handle(raw: &[u8], link: Option<LinkType>, config: &Config, format: OutputFormat) -> Result<()> {
    // Never prompt or edit the rule file from here
    let mut engine_config = config.rule_engine_config();
    engine_config.interactive = false;
    let rules = Arc::new(super::build_rules(engine_config)?);

    let pipeline = super::build_pipeline(config, rules, link.unwrap_or(config.capture.link_type))?;
    let report = simulate(&pipeline, raw);

    format.print_value(&report, || {
        let verdict = match report.verdict {
            Verdict::Accept => "ACCEPT".green(),
            Verdict::Drop => "DROP".red(),
        };
        format!("{} {} ({})", verdict, report.tuple, report.info)
    });
    Ok(())
}
