//! Binary metrics, confusion matrix and per-row scoring

use crate::sampler::Split;
use critiq_common::schema::{GoldAnnotation, Label, PredictionRecord};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How `unknown` enters precision/recall/F1/accuracy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricsPolicy {
    /// Rows with gold or prediction `unknown` are excluded
    ExcludeUnknown,
    /// Predicted `unknown` scores as `negative`; gold `unknown` is excluded
    UnknownAsNegative,
}

impl MetricsPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "exclude_unknown" => Some(MetricsPolicy::ExcludeUnknown),
            "unknown_as_negative" => Some(MetricsPolicy::UnknownAsNegative),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MetricsPolicy::ExcludeUnknown => "exclude_unknown",
            MetricsPolicy::UnknownAsNegative => "unknown_as_negative",
        }
    }

    /// Binary outcome of one (gold, predicted) pair under this policy
    pub fn outcome(self, gold: Label, predicted: Label) -> ScoreOutcome {
        let predicted = match (self, predicted) {
            (MetricsPolicy::UnknownAsNegative, Label::Unknown) => Label::Negative,
            (_, p) => p,
        };
        match (gold, predicted) {
            (Label::Unknown, _) | (_, Label::Unknown) => ScoreOutcome::Excluded,
            (Label::Positive, Label::Positive) => ScoreOutcome::Tp,
            (Label::Negative, Label::Positive) => ScoreOutcome::Fp,
            (Label::Positive, Label::Negative) => ScoreOutcome::Fn,
            (Label::Negative, Label::Negative) => ScoreOutcome::Tn,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreOutcome {
    Tp,
    Fp,
    Fn,
    Tn,
    Excluded,
}

/// tp/fp/fn/tn tallies with derived ratios; zero denominators give 0.0
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BinaryCounts {
    pub tp: u64,
    pub fp: u64,
    #[serde(rename = "fn")]
    pub fn_: u64,
    pub tn: u64,
}

impl BinaryCounts {
    pub fn add(&mut self, outcome: ScoreOutcome) {
        match outcome {
            ScoreOutcome::Tp => self.tp += 1,
            ScoreOutcome::Fp => self.fp += 1,
            ScoreOutcome::Fn => self.fn_ += 1,
            ScoreOutcome::Tn => self.tn += 1,
            ScoreOutcome::Excluded => {}
        }
    }

    pub fn total(&self) -> u64 {
        self.tp + self.fp + self.fn_ + self.tn
    }

    pub fn precision(&self) -> f64 {
        ratio(self.tp, self.tp + self.fp)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.tp, self.tp + self.fn_)
    }

    pub fn f1(&self) -> f64 {
        ratio(2 * self.tp, 2 * self.tp + self.fp + self.fn_)
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.tp + self.tn, self.total())
    }

    pub fn summary(&self) -> BinaryMetrics {
        BinaryMetrics {
            counts: *self,
            precision: self.precision(),
            recall: self.recall(),
            f1: self.f1(),
            accuracy: self.accuracy(),
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BinaryMetrics {
    #[serde(flatten)]
    pub counts: BinaryCounts,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub accuracy: f64,
}

/// 3×3 gold × predicted counts in `Label::ALL` order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub labels: Vec<Label>,
    /// `counts[gold][predicted]`
    pub counts: [[u64; 3]; 3],
}

impl ConfusionMatrix {
    pub fn new() -> Self {
        Self {
            labels: Label::ALL.to_vec(),
            counts: [[0; 3]; 3],
        }
    }

    pub fn add(&mut self, gold: Label, predicted: Label) {
        self.counts[gold.index()][predicted.index()] += 1;
    }

    pub fn get(&self, gold: Label, predicted: Label) -> u64 {
        self.counts[gold.index()][predicted.index()]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().flatten().sum()
    }
}

/// One prediction joined to its gold row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredRow {
    pub item_id: String,
    pub context_id: String,
    /// Split the benchmark ran on
    pub split: Split,
    /// Split recorded on the gold row
    pub gold_split: String,
    pub gold: Label,
    pub predicted: Label,
    pub confidence: f64,
    pub outcome: ScoreOutcome,
    pub parse_error: bool,
    pub schema_error: bool,
    pub used_fallback: bool,
    pub service_failure: bool,
    pub ambiguity_flag: bool,
}

/// Benchmark metrics of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub policy: MetricsPolicy,
    pub split: Split,
    pub num_predictions: u64,
    /// Predictions joined to a gold row
    pub num_examples: u64,
    #[serde(flatten)]
    pub binary: BinaryMetrics,
    pub excluded: u64,
    pub confusion: ConfusionMatrix,
    pub parse_errors: u64,
    pub schema_errors: u64,
    pub service_failures: u64,
    pub fallbacks: u64,
    pub missing_gold: u64,
    pub missing_gold_item_ids: Vec<String>,
    pub gold_split_mismatch: u64,
    pub gold_split_mismatch_item_ids: Vec<String>,
}

/// Join predictions to gold and score them
///
/// Predictions without a gold row are counted as missing; error counts
/// cover every prediction. `tp + fp + fn + tn + excluded == num_examples`.
pub fn score(
    predictions: &[PredictionRecord],
    gold: &BTreeMap<String, GoldAnnotation>,
    split: Split,
    policy: MetricsPolicy,
) -> (Vec<ScoredRow>, Metrics) {
    let mut rows = Vec::with_capacity(predictions.len());
    let mut counts = BinaryCounts::default();
    let mut confusion = ConfusionMatrix::new();
    let mut excluded = 0u64;
    let mut missing_gold_item_ids = Vec::new();
    let mut gold_split_mismatch_item_ids = Vec::new();
    let (mut parse_errors, mut schema_errors, mut service_failures, mut fallbacks) = (0, 0, 0, 0);

    for prediction in predictions {
        parse_errors += u64::from(prediction.parse_error);
        schema_errors += u64::from(prediction.schema_error);
        service_failures += u64::from(prediction.service_failure);
        fallbacks += u64::from(prediction.used_fallback);

        let Some(gold_row) = gold.get(&prediction.item_id) else {
            missing_gold_item_ids.push(prediction.item_id.clone());
            continue;
        };
        if Split::parse(&gold_row.split) != Some(split) {
            gold_split_mismatch_item_ids.push(prediction.item_id.clone());
        }

        let outcome = policy.outcome(gold_row.label, prediction.label);
        counts.add(outcome);
        if outcome == ScoreOutcome::Excluded {
            excluded += 1;
        }
        confusion.add(gold_row.label, prediction.label);

        rows.push(ScoredRow {
            item_id: prediction.item_id.clone(),
            context_id: prediction.context_id.clone(),
            split,
            gold_split: gold_row.split.clone(),
            gold: gold_row.label,
            predicted: prediction.label,
            confidence: prediction.confidence,
            outcome,
            parse_error: prediction.parse_error,
            schema_error: prediction.schema_error,
            used_fallback: prediction.used_fallback,
            service_failure: prediction.service_failure,
            ambiguity_flag: gold_row.ambiguity_flag,
        });
    }

    let metrics = Metrics {
        policy,
        split,
        num_predictions: predictions.len() as u64,
        num_examples: rows.len() as u64,
        binary: counts.summary(),
        excluded,
        confusion,
        parse_errors,
        schema_errors,
        service_failures,
        fallbacks,
        missing_gold: missing_gold_item_ids.len() as u64,
        missing_gold_item_ids,
        gold_split_mismatch: gold_split_mismatch_item_ids.len() as u64,
        gold_split_mismatch_item_ids,
    };
    (rows, metrics)
}
