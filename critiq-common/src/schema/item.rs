//! Source items and gold annotations

use super::Label;
use serde::{Deserialize, Serialize};

/// Immutable source text record
///
/// Produced by ingestion; `context_id` has already been resolved against the
/// reference catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub item_id: String,
    pub context_id: String,
    pub text: String,
    #[serde(default)]
    pub numeric_filter_score: f64,
}

/// Held-out human annotation, authoritative for benchmark metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoldAnnotation {
    pub item_id: String,
    pub split: String,
    #[serde(default)]
    pub context_id: Option<String>,
    #[serde(default)]
    pub label: Label,
    #[serde(default)]
    pub rationale_text: String,
    #[serde(default)]
    pub ambiguity_flag: bool,
}

/// Fixed tokenizer: Unicode whitespace-separated tokens
///
/// Used for length bucketing and for token estimates when the service does
/// not report usage.
pub fn token_count(text: &str) -> usize {
    text.split_whitespace().count()
}
