//! `classify` stage in benchmark and full-corpus modes
//!
//! Both modes snapshot the same configuration object, so a full-corpus run
//! can be checked against the benchmark run a gate accepted.

use super::{close_call_log, file_input, status_for, ServiceSnapshot, StageContext, StageReport};
use crate::benchmark::{index_gold, ordered_items, run_benchmark};
use crate::classify::{classify_items, ClassificationConfig};
use crate::gate::{GateDecision, Verdict};
use crate::run::{
    ResolvedRun, RunDir, TraceLog, CALLS_FILE, METRICS_FILE, PARSE_OUTCOMES_FILE, PREDICTIONS_FILE, SCORED_FILE,
};
use crate::sampler::Split;
use critiq_common::manifest::{ManifestDraft, Stage};
use critiq_common::schema::{GoldAnnotation, Item, PredictionRecord};
use critiq_common::{jsonl, Error, Result};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct BenchmarkArgs {
    /// Run id or directory of a `sample` run
    pub sample_run: String,
    pub split: Split,
    pub gold: PathBuf,
}

#[derive(Debug, Clone)]
pub struct FullCorpusArgs {
    pub corpus: PathBuf,
    /// Gate run whose accepted configuration this run must match
    pub gate_run: Option<String>,
}

#[derive(Serialize)]
struct ClassifyRunConfig<'a> {
    classification: &'a ClassificationConfig,
    service: ServiceSnapshot,
}

fn load_config(ctx: &StageContext) -> Result<ClassificationConfig> {
    Ok(ClassificationConfig::from_section(
        &ctx.config.classification,
        &ctx.config.service.model,
    )?)
}

fn record_prediction_counts(draft: &mut ManifestDraft, predictions: &[PredictionRecord], skipped: usize) {
    let count = |f: fn(&PredictionRecord) -> bool| predictions.iter().filter(|p| f(p)).count() as u64;
    draft.set_count("predictions", predictions.len() as u64);
    draft.set_count("skipped", skipped as u64);
    draft.set_count("accepted", count(|p| p.is_accepted()));
    draft.set_count("parse_errors", count(|p| p.parse_error));
    draft.set_count("schema_errors", count(|p| p.schema_error));
    draft.set_count("service_failures", count(|p| p.service_failure));
    draft.set_count("fallbacks", count(|p| p.used_fallback));
}

/// Classify one sampled split and score it against gold labels
pub async fn run_classify_benchmark(ctx: &StageContext, args: &BenchmarkArgs) -> Result<StageReport> {
    let config = load_config(ctx)?;

    let sample_run = ResolvedRun::resolve(&ctx.registry, &args.sample_run).await?;
    sample_run.expect_stage(&[Stage::Sample])?;
    let items: Vec<Item> = sample_run.read_rows(args.split.role())?;
    let gold: Vec<GoldAnnotation> = jsonl::read_rows(&args.gold)?;
    index_gold(&gold)?;
    ordered_items(&items)?;

    let snapshot = ClassifyRunConfig {
        classification: &config,
        service: ServiceSnapshot::from_config(&ctx.config),
    };
    let mut draft = ManifestDraft::new(Stage::ClassifyBenchmark, &ctx.code_version, &snapshot)?;
    draft.set_prompt_hash(config.template_sha256.clone());
    draft.add_upstream("sample", sample_run.run_id());
    draft.add_input(sample_run.input_artifact(args.split.role())?);
    draft.add_input(file_input("gold", &args.gold, Some(gold.len() as u64))?);

    let run_dir = RunDir::create(&ctx.root, draft.run_id())?;
    let log = TraceLog::create(&run_dir.file(CALLS_FILE), &run_dir.file(PARSE_OUTCOMES_FILE))?;
    let invoker = ctx.invoker();
    tracing::info!(run_id = %draft.run_id(), split = %args.split, sample_run = %sample_run.run_id(), "Benchmark classification");

    let deadline = ctx.deadline();
    let outcome = run_benchmark(
        &config,
        &invoker,
        &log,
        &items,
        &gold,
        args.split,
        ctx.concurrency(),
        deadline.token(),
    )
    .await?;

    run_dir.write_rows(&mut draft, "predictions", PREDICTIONS_FILE, &outcome.predictions)?;
    run_dir.write_rows(&mut draft, "scored", SCORED_FILE, &outcome.scored)?;
    run_dir.write_json(&mut draft, "metrics", METRICS_FILE, &outcome.metrics)?;

    draft.set_count("items", items.len() as u64);
    draft.set_count("examples", outcome.metrics.num_examples);
    draft.set_count("missing_gold", outcome.metrics.missing_gold);
    record_prediction_counts(&mut draft, &outcome.predictions, outcome.skipped);

    let usage = close_call_log(&run_dir, &mut draft, &log, invoker.ledger())?;
    ctx.finalize(&run_dir, draft, usage, status_for(outcome.skipped)).await
}

/// Classify a whole corpus, optionally only with a gate-accepted configuration
pub async fn run_classify_full_corpus(ctx: &StageContext, args: &FullCorpusArgs) -> Result<StageReport> {
    let config = load_config(ctx)?;
    let corpus: Vec<Item> = jsonl::read_rows(&args.corpus)?;
    let items = ordered_items(&corpus)?;

    let snapshot = ClassifyRunConfig {
        classification: &config,
        service: ServiceSnapshot::from_config(&ctx.config),
    };
    let mut draft = ManifestDraft::new(Stage::ClassifyFullCorpus, &ctx.code_version, &snapshot)?;
    draft.set_prompt_hash(config.template_sha256.clone());
    draft.add_input(file_input("corpus", &args.corpus, Some(corpus.len() as u64))?);

    if let Some(locator) = &args.gate_run {
        let gate_run = ResolvedRun::resolve(&ctx.registry, locator).await?;
        gate_run.expect_stage(&[Stage::Gate])?;
        let decision: GateDecision = jsonl::read_json(&gate_run.verified_output("decision")?)?;
        if decision.verdict != Verdict::Accept {
            return Err(Error::Precondition(format!(
                "Gate run {} rejected run {}",
                gate_run.run_id(),
                decision.new_run_id
            )));
        }
        let accepted = ResolvedRun::resolve(&ctx.registry, &decision.new_run_id).await?;
        if accepted.manifest.configuration_hash != draft.configuration_hash() {
            return Err(Error::Precondition(format!(
                "Configuration hash {} differs from {} accepted by gate run {}",
                draft.configuration_hash(),
                accepted.manifest.configuration_hash,
                gate_run.run_id()
            )));
        }
        draft.add_upstream("gate", gate_run.run_id());
        draft.add_input(gate_run.input_artifact("decision")?);
    }

    let run_dir = RunDir::create(&ctx.root, draft.run_id())?;
    let log = TraceLog::create(&run_dir.file(CALLS_FILE), &run_dir.file(PARSE_OUTCOMES_FILE))?;
    let invoker = ctx.invoker();
    tracing::info!(run_id = %draft.run_id(), items = items.len(), "Full-corpus classification");

    let deadline = ctx.deadline();
    let batch = classify_items(&config, &invoker, &log, &items, ctx.concurrency(), deadline.token()).await?;
    let skipped = batch.skipped();
    let predictions: Vec<PredictionRecord> = batch.predictions.into_iter().flatten().collect();

    run_dir.write_rows(&mut draft, "predictions", PREDICTIONS_FILE, &predictions)?;
    draft.set_count("items", items.len() as u64);
    record_prediction_counts(&mut draft, &predictions, skipped);

    let usage = close_call_log(&run_dir, &mut draft, &log, invoker.ledger())?;
    ctx.finalize(&run_dir, draft, usage, status_for(skipped)).await
}
