//! Two-phase parsing of untrusted service output
//!
//! Phase one extracts an untyped JSON object from free text ([`extract`]);
//! phase two validates it into a typed value in the consuming module, using
//! the field accessors in [`fields`]. Nothing unvalidated leaves a consumer.

pub mod extract;
pub mod fields;

pub use extract::{extract_object, Extracted};

use serde::{Deserialize, Serialize};

/// How a response fared through both phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseOutcome {
    /// Whole response was one JSON object and it validated
    Strict,
    /// Object found by the best-effort scan and it validated
    Fallback,
    /// No object could be extracted
    ParseError,
    /// Object extracted but failed validation
    SchemaError,
}

impl ParseOutcome {
    pub fn from_phases(used_fallback: bool, valid: bool) -> Self {
        match (valid, used_fallback) {
            (true, false) => ParseOutcome::Strict,
            (true, true) => ParseOutcome::Fallback,
            (false, _) => ParseOutcome::SchemaError,
        }
    }
}
