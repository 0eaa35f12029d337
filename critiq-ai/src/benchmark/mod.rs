//! Benchmark runner
//!
//! Classifies one split in `item_id` order, joins predictions to gold and
//! computes metrics under the configured policy.

pub mod metrics;

pub use metrics::{
    score, BinaryCounts, BinaryMetrics, ConfusionMatrix, Metrics, MetricsPolicy, ScoreOutcome, ScoredRow,
};

use crate::classify::{classify_items, ClassificationConfig};
use crate::run::TraceSink;
use crate::sampler::Split;
use crate::service::ServiceInvoker;
use critiq_common::schema::{GoldAnnotation, Item, PredictionRecord};
use critiq_common::{Error, Result};
use std::collections::{BTreeMap, HashSet};
use tokio_util::sync::CancellationToken;

/// Result of one benchmark
#[derive(Debug, Clone)]
pub struct BenchmarkOutcome {
    /// In `item_id` order; skipped items are absent
    pub predictions: Vec<PredictionRecord>,
    pub scored: Vec<ScoredRow>,
    pub metrics: Metrics,
    /// Items not classified because the stage deadline passed
    pub skipped: usize,
}

/// Index gold rows by `item_id`; duplicates are a precondition violation
pub fn index_gold(gold: &[GoldAnnotation]) -> Result<BTreeMap<String, GoldAnnotation>> {
    let mut index = BTreeMap::new();
    for row in gold {
        if index.insert(row.item_id.clone(), row.clone()).is_some() {
            return Err(Error::Precondition(format!(
                "Duplicate item_id in gold file: {}",
                row.item_id
            )));
        }
    }
    Ok(index)
}

/// Sort items by `item_id`, rejecting duplicates
pub fn ordered_items(items: &[Item]) -> Result<Vec<Item>> {
    let mut seen = HashSet::with_capacity(items.len());
    for item in items {
        if !seen.insert(item.item_id.as_str()) {
            return Err(Error::Precondition(format!(
                "Duplicate item_id in input: {}",
                item.item_id
            )));
        }
    }
    let mut ordered = items.to_vec();
    ordered.sort_by(|a, b| a.item_id.cmp(&b.item_id));
    Ok(ordered)
}

/// Classify and score one split
#[allow(clippy::too_many_arguments)]
pub async fn run_benchmark(
    config: &ClassificationConfig,
    invoker: &ServiceInvoker,
    sink: &dyn TraceSink,
    split_items: &[Item],
    gold: &[GoldAnnotation],
    split: Split,
    concurrency: usize,
    cancel: &CancellationToken,
) -> Result<BenchmarkOutcome> {
    let gold = index_gold(gold)?;
    let items = ordered_items(split_items)?;

    tracing::info!(
        split = %split,
        items = items.len(),
        config_id = %config.config_id,
        "Running benchmark"
    );

    let batch = classify_items(config, invoker, sink, &items, concurrency, cancel).await?;
    let skipped = batch.skipped();
    let predictions: Vec<PredictionRecord> = batch.predictions.into_iter().flatten().collect();

    let (scored, metrics) = score(&predictions, &gold, split, config.metrics_policy);

    if metrics.missing_gold > 0 {
        tracing::warn!(
            missing_gold = metrics.missing_gold,
            "Predictions without a gold row were excluded from metrics"
        );
    }
    if metrics.gold_split_mismatch > 0 {
        tracing::warn!(
            mismatched = metrics.gold_split_mismatch,
            split = %split,
            "Gold rows annotated for a different split"
        );
    }
    tracing::info!(
        f1 = metrics.binary.f1,
        precision = metrics.binary.precision,
        recall = metrics.binary.recall,
        excluded = metrics.excluded,
        "Benchmark metrics computed"
    );

    Ok(BenchmarkOutcome {
        predictions,
        scored,
        metrics,
        skipped,
    })
}
