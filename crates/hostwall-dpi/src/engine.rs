//! Signature Engine
//!
//! Holds the ordered signature list and classifies payloads against it.
//! Inspection takes a read lock only; adds and removes are serialised by
//! the write lock so duplicate detection and insertion are one step.

use crate::compiler::CompiledSignature;
use crate::defaults::default_signatures;
use crate::{Classification, DpiError, Result};
use hostwall_common::AtomicCounter;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, info};

/// Signature definition as found in configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureSpec {
    /// Unique name
    pub name: String,
    /// Byte-level regular expression
    pub pattern: String,
    /// Classification on match
    pub result: Classification,
    /// Fold ASCII case
    #[serde(default)]
    pub case_insensitive: bool,
}

impl SignatureSpec {
    pub fn new(
        name: impl Into<String>,
        pattern: impl Into<String>,
        result: Classification,
        case_insensitive: bool,
    ) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            result,
            case_insensitive,
        }
    }
}

/// Listing entry, in evaluation order
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SignatureInfo {
    pub name: String,
    pub pattern: String,
    pub result: Classification,
    pub case_insensitive: bool,
}

impl From<&CompiledSignature> for SignatureInfo {
    fn from(sig: &CompiledSignature) -> Self {
        Self {
            name: sig.name.clone(),
            pattern: sig.pattern.clone(),
            result: sig.result,
            case_insensitive: sig.case_insensitive,
        }
    }
}

/// Inspection result
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inspection {
    /// Classification of the first matching signature, or `Unknown`
    pub classification: Classification,

    /// Name of the signature that matched
    pub matched: Option<String>,
}

impl Inspection {
    /// Result when nothing matched
    pub fn unknown() -> Self {
        Self {
            classification: Classification::Unknown,
            matched: None,
        }
    }

    /// Check if a signature matched
    pub fn is_match(&self) -> bool {
        self.matched.is_some()
    }
}

/// Engine statistics
#[derive(Default)]
pub struct EngineStats {
    pub payloads_inspected: AtomicCounter,
    pub bytes_inspected: AtomicCounter,
    pub matches_found: AtomicCounter,
}

/// Plain copy of [`EngineStats`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatsSnapshot {
    pub payloads_inspected: u64,
    pub bytes_inspected: u64,
    pub matches_found: u64,
}

impl EngineStats {
    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            payloads_inspected: self.payloads_inspected.get(),
            bytes_inspected: self.bytes_inspected.get(),
            matches_found: self.matches_found.get(),
        }
    }
}

/// DPI signature engine
#[derive(Default)]
pub struct SignatureEngine {
    signatures: RwLock<Vec<CompiledSignature>>,
    stats: EngineStats,
}

impl fmt::Debug for SignatureEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let signatures = self.signatures.read();
        f.debug_struct("SignatureEngine")
            .field("signatures", &signatures.iter().map(|s| s.name.as_str()).collect::<Vec<_>>())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl SignatureEngine {
    /// Create empty engine
    pub fn new() -> Self {
        Self::default()
    }

    /// Create engine seeded with the built-in HTTP/TLS/SSH/DNS set
    pub fn with_defaults() -> Result<Self> {
        let engine = Self::new();
        engine.add_all(default_signatures())?;
        Ok(engine)
    }

    /// Append a signature at the end of the evaluation order.
    ///
    /// The pattern is compiled before the list is touched, so an invalid
    /// pattern or a duplicate name leaves the engine unchanged.
    pub fn add_signature(
        &self,
        name: &str,
        pattern: &str,
        result: Classification,
        case_insensitive: bool,
    ) -> Result<()> {
        let compiled = CompiledSignature::compile(name, pattern, result, case_insensitive)?;

        let mut signatures = self.signatures.write();
        if signatures.iter().any(|s| s.name == compiled.name) {
            return Err(DpiError::Duplicate(compiled.name));
        }

        debug!(name = %compiled.name, result = %compiled.result, "Signature added");
        signatures.push(compiled);
        Ok(())
    }

    /// Append a signature from its definition
    pub fn add(&self, spec: SignatureSpec) -> Result<()> {
        self.add_signature(&spec.name, &spec.pattern, spec.result, spec.case_insensitive)
    }

    /// Append several signatures, all or none
    pub fn add_all(&self, specs: impl IntoIterator<Item = SignatureSpec>) -> Result<usize> {
        let mut compiled = Vec::new();
        let mut names = HashSet::new();

        for spec in specs {
            if !names.insert(spec.name.clone()) {
                return Err(DpiError::Duplicate(spec.name));
            }
            compiled.push(CompiledSignature::compile(
                spec.name,
                spec.pattern,
                spec.result,
                spec.case_insensitive,
            )?);
        }

        let mut signatures = self.signatures.write();
        if let Some(dup) = signatures.iter().find(|s| names.contains(&s.name)) {
            return Err(DpiError::Duplicate(dup.name.clone()));
        }

        let count = compiled.len();
        signatures.extend(compiled);
        info!(count, total = signatures.len(), "Signatures loaded");
        Ok(count)
    }

    /// Remove a signature by name. Order of the rest is preserved.
    pub fn remove_signature(&self, name: &str) -> Result<SignatureInfo> {
        let mut signatures = self.signatures.write();
        let index = signatures
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| DpiError::NotFound(name.to_string()))?;

        let removed = signatures.remove(index);
        debug!(name, "Signature removed");
        Ok(SignatureInfo::from(&removed))
    }

    /// Signatures in evaluation order
    pub fn list_signatures(&self) -> Vec<SignatureInfo> {
        self.signatures.read().iter().map(SignatureInfo::from).collect()
    }

    /// Drop every signature
    pub fn clear(&self) {
        self.signatures.write().clear();
    }

    pub fn len(&self) -> usize {
        self.signatures.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.read().is_empty()
    }

    /// Classify a payload. The first signature that matches anywhere in
    /// `payload` wins; an empty payload is matched like any other.
    pub fn inspect(&self, payload: &[u8]) -> Inspection {
        self.stats.payloads_inspected.inc();
        self.stats.bytes_inspected.add(payload.len() as u64);

        let signatures = self.signatures.read();
        for sig in signatures.iter() {
            if sig.is_match(payload) {
                self.stats.matches_found.inc();
                return Inspection {
                    classification: sig.result,
                    matched: Some(sig.name.clone()),
                };
            }
        }

        Inspection::unknown()
    }

    /// Classify text given on the command line.
    ///
    /// `\xNN` escapes are decoded to raw bytes so binary signatures can be
    /// exercised without a capture.
    pub fn test_payload(&self, text: &str) -> Inspection {
        self.inspect(&unescape(text))
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }
}

/// Decode `\xNN`, `\r`, `\n`, `\t`, `\0` and `\\`; anything else is literal
fn unescape(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'\\' || i + 1 >= bytes.len() {
            out.push(bytes[i]);
            i += 1;
            continue;
        }

        match bytes[i + 1] {
            b'x' if bytes.len() >= i + 4 && is_hex_pair(&bytes[i + 2..i + 4]) => {
                out.push(hex_value(bytes[i + 2]) << 4 | hex_value(bytes[i + 3]));
                i += 4;
            }
            b'r' => {
                out.push(b'\r');
                i += 2;
            }
            b'n' => {
                out.push(b'\n');
                i += 2;
            }
            b't' => {
                out.push(b'\t');
                i += 2;
            }
            b'0' => {
                out.push(0);
                i += 2;
            }
            b'\\' => {
                out.push(b'\\');
                i += 2;
            }
            _ => {
                out.push(b'\\');
                i += 1;
            }
        }
    }

    out
}

fn is_hex_pair(pair: &[u8]) -> bool {
    pair.len() == 2 && pair.iter().all(u8::is_ascii_hexdigit)
}

fn hex_value(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        b'A'..=b'F' => c - b'A' + 10,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_lists_names_in_order() {
        let engine = SignatureEngine::with_defaults().unwrap();
        let text = format!("{engine:?}");
        assert!(text.starts_with("SignatureEngine"));
        assert!(text.contains(r#"["HTTP", "TLS", "SSH", "DNS"]"#));
    }

    #[test]
    fn test_first_match_wins() {
        let engine = SignatureEngine::new();
        engine.add_signature("generic", "^GET", Classification::Block, false).unwrap();
        engine.add_signature("http", "^GET ", Classification::Http, false).unwrap();

        let result = engine.inspect(b"GET / HTTP/1.1\r\n");
        assert_eq!(result.classification, Classification::Block);
        assert_eq!(result.matched.as_deref(), Some("generic"));
    }

    #[test]
    fn test_no_match_is_unknown() {
        let engine = SignatureEngine::new();
        assert_eq!(engine.inspect(b"anything").classification, Classification::Unknown);

        engine.add_signature("ssh", "^SSH-", Classification::Ssh, false).unwrap();
        let result = engine.inspect(b"");
        assert_eq!(result, Inspection::unknown());
        assert!(!result.is_match());
    }

    #[test]
    fn test_duplicate_rejected() {
        let engine = SignatureEngine::new();
        engine.add_signature("http", "^GET ", Classification::Http, false).unwrap();

        let err = engine
            .add_signature("http", "^POST ", Classification::Http, false)
            .unwrap_err();
        assert!(matches!(err, DpiError::Duplicate(name) if name == "http"));

        // The original is still the one in effect
        assert_eq!(engine.len(), 1);
        assert_eq!(engine.list_signatures()[0].pattern, "^GET ");
    }

    #[test]
    fn test_invalid_pattern_leaves_engine_unchanged() {
        let engine = SignatureEngine::new();
        engine.add_signature("tls", r"^\x16\x03", Classification::Tls, false).unwrap();

        let err = engine.add_signature("broken", "[unclosed", Classification::Http, false);
        assert!(matches!(err, Err(DpiError::InvalidPattern { .. })));
        assert_eq!(engine.len(), 1);

        // Nothing matches-everything behind our back
        assert_eq!(engine.inspect(b"hello").classification, Classification::Unknown);
    }

    #[test]
    fn test_remove_then_readd() {
        let engine = SignatureEngine::new();
        engine.add_signature("http", "^GET ", Classification::Http, false).unwrap();
        engine.add_signature("ssh", "^SSH-", Classification::Ssh, false).unwrap();

        let removed = engine.remove_signature("http").unwrap();
        assert_eq!(removed.name, "http");
        assert_eq!(engine.inspect(b"GET / ").classification, Classification::Unknown);
        assert!(matches!(engine.remove_signature("http"), Err(DpiError::NotFound(_))));

        engine.add_signature("http", "^GET ", Classification::Http, false).unwrap();
        assert_eq!(engine.inspect(b"GET / ").classification, Classification::Http);

        let names: Vec<_> = engine.list_signatures().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["ssh", "http"]);
    }

    #[test]
    fn test_http_vs_tls() {
        let engine = SignatureEngine::new();
        engine.add_signature("HTTP", "^GET ", Classification::Http, true).unwrap();
        engine.add_signature("TLS", r"^\x16\x03", Classification::Tls, false).unwrap();

        assert_eq!(engine.inspect(b"GET / HTTP/1.1").classification, Classification::Http);
        assert_eq!(engine.inspect(b"get / HTTP/1.1").classification, Classification::Http);
        assert_eq!(engine.inspect(&[0x16, 0x03, 0x01]).classification, Classification::Tls);
    }

    #[test]
    fn test_add_all_is_atomic() {
        let engine = SignatureEngine::new();
        let specs = vec![
            SignatureSpec::new("a", "^a", Classification::None, false),
            SignatureSpec::new("b", "(", Classification::None, false),
        ];
        assert!(engine.add_all(specs).is_err());
        assert!(engine.is_empty());

        let dupes = vec![
            SignatureSpec::new("a", "^a", Classification::None, false),
            SignatureSpec::new("a", "^b", Classification::None, false),
        ];
        assert!(matches!(engine.add_all(dupes), Err(DpiError::Duplicate(_))));
        assert!(engine.is_empty());
    }

    #[test]
    fn test_payload_escapes() {
        assert_eq!(unescape(r"\x16\x03\x01"), vec![0x16, 0x03, 0x01]);
        assert_eq!(unescape(r"GET /\r\n"), b"GET /\r\n".to_vec());
        assert_eq!(unescape(r"\xZZ"), b"\\xZZ".to_vec());
        assert_eq!(unescape("tail\\"), b"tail\\".to_vec());

        let engine = SignatureEngine::with_defaults().unwrap();
        assert_eq!(engine.test_payload(r"\x16\x03\x01\x00\xc8").classification, Classification::Tls);
    }

    #[test]
    fn test_stats() {
        let engine = SignatureEngine::with_defaults().unwrap();
        engine.inspect(b"SSH-2.0-x");
        engine.inspect(b"zz");

        let stats = engine.stats().snapshot();
        assert_eq!(stats.payloads_inspected, 2);
        assert_eq!(stats.bytes_inspected, 11);
        assert_eq!(stats.matches_found, 1);
    }
}
