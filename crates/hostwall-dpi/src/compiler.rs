//! Signature Compiler
//!
//! Turns a textual pattern into a byte-level regular expression. Unicode
//! mode is switched off so `.` and classes range over single bytes and
//! case-insensitive matching folds ASCII letters only.

use crate::{Classification, DpiError, Result};
use regex::bytes::{Regex, RegexBuilder};

/// Upper bound on compiled program size per signature
const SIZE_LIMIT: usize = 1 << 20;

/// Compiled signature with metadata
#[derive(Clone, Debug)]
pub struct CompiledSignature {
    /// Unique name
    pub name: String,

    /// Pattern as written (for listing and debugging)
    pub pattern: String,

    /// Classification reported on match
    pub result: Classification,

    /// Is case insensitive
    pub case_insensitive: bool,

    regex: Regex,
}

impl CompiledSignature {
    /// Compile a signature; nothing is returned on failure
    pub fn compile(
        name: impl Into<String>,
        pattern: impl Into<String>,
        result: Classification,
        case_insensitive: bool,
    ) -> Result<Self> {
        let name = name.into();
        let pattern = pattern.into();

        if name.trim().is_empty() {
            return Err(DpiError::EmptyName);
        }

        let regex = compile_pattern(&pattern, case_insensitive).map_err(|source| {
            DpiError::InvalidPattern {
                name: name.clone(),
                pattern: pattern.clone(),
                source,
            }
        })?;

        Ok(Self {
            name,
            pattern,
            result,
            case_insensitive,
            regex,
        })
    }

    /// Search anywhere in the payload (patterns anchor themselves with `^`)
    #[inline]
    pub fn is_match(&self, payload: &[u8]) -> bool {
        self.regex.is_match(payload)
    }
}

/// Build a byte regex with ASCII-only case folding
pub fn compile_pattern(pattern: &str, case_insensitive: bool) -> std::result::Result<Regex, regex::Error> {
    RegexBuilder::new(pattern)
        .unicode(false)
        .case_insensitive(case_insensitive)
        .size_limit(SIZE_LIMIT)
        .build()
}
