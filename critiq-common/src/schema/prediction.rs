//! Normalized prediction records

use super::Label;
use serde::{Deserialize, Serialize};

/// Outcome flags carried by a prediction
///
/// `used_fallback` is informational; the other three are error flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PredictionFlags {
    pub parse_error: bool,
    pub schema_error: bool,
    pub used_fallback: bool,
    pub service_failure: bool,
}

impl PredictionFlags {
    pub fn has_error(&self) -> bool {
        self.parse_error || self.schema_error || self.service_failure
    }
}

/// One classification outcome per (item, configuration)
///
/// Invariants (established by [`PredictionRecord::new`] and re-established
/// on every deserialization):
/// - an error flag forces `label = unknown` and `confidence = 0.0`
/// - confidence outside `[0, 1]` (or NaN) becomes `0.0`
/// - a non-positive label carries empty rationale and evidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "PredictionRow")]
pub struct PredictionRecord {
    pub item_id: String,
    pub context_id: String,
    pub label: Label,
    pub rationale_summary: String,
    pub evidence_snippet: String,
    pub confidence: f64,
    pub parse_error: bool,
    pub schema_error: bool,
    pub used_fallback: bool,
    pub service_failure: bool,
}

impl PredictionRecord {
    pub fn new(
        item_id: impl Into<String>,
        context_id: impl Into<String>,
        label: Label,
        rationale_summary: impl Into<String>,
        evidence_snippet: impl Into<String>,
        confidence: f64,
        flags: PredictionFlags,
    ) -> Self {
        let mut record = Self {
            item_id: item_id.into(),
            context_id: context_id.into(),
            label,
            rationale_summary: rationale_summary.into(),
            evidence_snippet: evidence_snippet.into(),
            confidence,
            parse_error: flags.parse_error,
            schema_error: flags.schema_error,
            used_fallback: flags.used_fallback,
            service_failure: flags.service_failure,
        };
        record.enforce_invariants();
        record
    }

    /// Unknown prediction carrying only failure flags
    pub fn failed(
        item_id: impl Into<String>,
        context_id: impl Into<String>,
        flags: PredictionFlags,
    ) -> Self {
        Self::new(item_id, context_id, Label::Unknown, "", "", 0.0, flags)
    }

    pub fn flags(&self) -> PredictionFlags {
        PredictionFlags {
            parse_error: self.parse_error,
            schema_error: self.schema_error,
            used_fallback: self.used_fallback,
            service_failure: self.service_failure,
        }
    }

    pub fn has_error(&self) -> bool {
        self.flags().has_error()
    }

    /// Eligible for context-level clustering
    pub fn is_accepted(&self) -> bool {
        self.label == Label::Positive && !self.has_error()
    }

    fn enforce_invariants(&mut self) {
        if self.has_error() {
            self.label = Label::Unknown;
            self.confidence = 0.0;
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            self.confidence = 0.0;
        }
        if self.label != Label::Positive {
            self.rationale_summary.clear();
            self.evidence_snippet.clear();
        }
    }
}

/// On-disk shape; converted through the normalizing constructor
#[derive(Deserialize)]
struct PredictionRow {
    item_id: String,
    context_id: String,
    #[serde(default)]
    label: Label,
    #[serde(default)]
    rationale_summary: String,
    #[serde(default)]
    evidence_snippet: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    parse_error: bool,
    #[serde(default)]
    schema_error: bool,
    #[serde(default)]
    used_fallback: bool,
    #[serde(default)]
    service_failure: bool,
}

impl From<PredictionRow> for PredictionRecord {
    fn from(row: PredictionRow) -> Self {
        PredictionRecord::new(
            row.item_id,
            row.context_id,
            row.label,
            row.rationale_summary,
            row.evidence_snippet,
            row.confidence,
            PredictionFlags {
                parse_error: row.parse_error,
                schema_error: row.schema_error,
                used_fallback: row.used_fallback,
                service_failure: row.service_failure,
            },
        )
    }
}
