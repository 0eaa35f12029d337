//! `sample` stage: stratified draw of two benchmark splits

use super::{file_input, StageContext, StageReport};
use crate::run::{RunDir, SAMPLE_REPORT_FILE, SPLIT_A_FILE, SPLIT_B_FILE};
use crate::sampler::{sample, SampleParams, SampleTargets, Split};
use critiq_common::manifest::{ManifestDraft, RunStatus, Stage, UsageSummary};
use critiq_common::schema::Item;
use critiq_common::{jsonl, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct SampleArgs {
    pub corpus: PathBuf,
    pub seed: u64,
    pub targets: SampleTargets,
    pub focus_context: Option<String>,
}

#[derive(Serialize)]
struct SampleRunConfig<'a> {
    seed: u64,
    total: Option<usize>,
    per_bucket: BTreeMap<String, usize>,
    focus_context: Option<&'a str>,
    length_boundaries: &'a [usize],
    split_ratio: f64,
}

pub async fn run_sample(ctx: &StageContext, args: &SampleArgs) -> Result<StageReport> {
    let corpus: Vec<Item> = jsonl::read_rows(&args.corpus)?;
    let section = &ctx.config.sampler;
    let params = SampleParams {
        seed: args.seed,
        targets: args.targets.clone(),
        focus_context: args.focus_context.clone(),
        length_boundaries: section.length_boundaries.clone(),
        split_ratio: section.split_ratio,
    };
    let outcome = sample(&corpus, &params)?;

    let (total, per_bucket) = match &args.targets {
        SampleTargets::Total(n) => (Some(*n), BTreeMap::new()),
        SampleTargets::PerBucket(map) => (None, map.iter().map(|(k, v)| (k.to_string(), *v)).collect()),
    };
    let snapshot = SampleRunConfig {
        seed: args.seed,
        total,
        per_bucket,
        focus_context: args.focus_context.as_deref(),
        length_boundaries: &section.length_boundaries,
        split_ratio: section.split_ratio,
    };

    let mut draft = ManifestDraft::new(Stage::Sample, &ctx.code_version, &snapshot)?;
    draft.add_input(file_input("corpus", &args.corpus, Some(corpus.len() as u64))?);
    let run_dir = RunDir::create(&ctx.root, draft.run_id())?;
    tracing::info!(run_id = %draft.run_id(), corpus = corpus.len(), seed = args.seed, "Sampling");

    run_dir.write_rows(&mut draft, Split::A.role(), SPLIT_A_FILE, &outcome.split_a)?;
    run_dir.write_rows(&mut draft, Split::B.role(), SPLIT_B_FILE, &outcome.split_b)?;
    run_dir.write_json(&mut draft, "sample_report", SAMPLE_REPORT_FILE, &outcome.report)?;

    draft.set_count("corpus", outcome.report.corpus_size as u64);
    draft.set_count("pool", outcome.report.pool_size as u64);
    draft.set_count("focus", outcome.report.focus_count as u64);
    draft.set_count("split_a", outcome.split_a.len() as u64);
    draft.set_count("split_b", outcome.split_b.len() as u64);

    ctx.finalize(&run_dir, draft, UsageSummary::default(), RunStatus::Completed).await
}
