//! Signature commands

use crate::{config::Config, output::OutputFormat, SignatureCommands};
use anyhow::{Context, Result};
use hostwall_dpi::{Inspection, SignatureEngine, SignatureInfo};
use serde::Serialize;
use tabled::Tabled;

#[derive(Tabled)]
struct SignatureRow {
    #[tabled(rename = "#")]
    index: usize,
    name: String,
    result: String,
    pattern: String,
    #[tabled(rename = "nocase")]
    case_insensitive: bool,
}

fn row(index: usize, sig: &SignatureInfo) -> SignatureRow {
    SignatureRow {
        index,
        name: sig.name.clone(),
        result: sig.result.to_string(),
        pattern: sig.pattern.clone(),
        case_insensitive: sig.case_insensitive,
    }
}

#[derive(Debug, Serialize)]
struct TestReport {
    classification: String,
    matched: Option<String>,
}

/// Classify `payload` as escaped text, or as hex when `hex` is set
pub fn classify(engine: &SignatureEngine, payload: &str, hex: bool) -> Result<Inspection> {
    if hex {
        let bytes = hex::decode(payload.trim()).context("payload is not valid hex")?;
        Ok(engine.inspect(&bytes))
    } else {
        Ok(engine.test_payload(payload))
    }
}

pub fn handle(action: SignatureCommands, config: &Config, format: OutputFormat) -> Result<()> {
    let engine = super::build_signatures(config)?;

    match action {
        SignatureCommands::List => {
            format.print_rows(&engine.list_signatures(), row);
        }
        SignatureCommands::Test { payload, hex } => {
            let inspection = classify(&engine, &payload, hex)?;
            let report = TestReport {
                classification: inspection.classification.to_string(),
                matched: inspection.matched.clone(),
            };
            format.print_value(&report, || match &inspection.matched {
                Some(name) => format!("{} (signature {})", inspection.classification, name),
                None => inspection.classification.to_string(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostwall_dpi::Classification;

    #[test]
    fn test_classify_text_and_hex() {
        let engine = SignatureEngine::with_defaults().unwrap();

        let http = classify(&engine, r"GET / HTTP/1.1\r\n", false).unwrap();
        assert_eq!(http.classification, Classification::Http);
        assert_eq!(http.matched.as_deref(), Some("HTTP"));

        let tls = classify(&engine, "16030100a501", true).unwrap();
        assert_eq!(tls.classification, Classification::Tls);

        let escaped = classify(&engine, r"\x16\x03\x01", false).unwrap();
        assert_eq!(escaped.classification, Classification::Tls);

        assert!(classify(&engine, "zz", true).is_err());
    }
}
