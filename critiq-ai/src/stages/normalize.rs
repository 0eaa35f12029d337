//! `normalize-global` stage

use super::{close_call_log, file_input, status_for, ServiceSnapshot, StageContext, StageReport};
use crate::normalize::{normalize, NormalizationConfig};
use crate::run::{ResolvedRun, RunDir, TraceLog, BATCHES_FILE, CALLS_FILE, GLOBAL_ISSUES_FILE, PARSE_OUTCOMES_FILE, UNASSIGNED_FILE};
use critiq_common::manifest::{ManifestDraft, Stage};
use critiq_common::schema::{Cluster, Taxonomy};
use critiq_common::{Error, Result};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct NormalizeArgs {
    /// Run id or directory of a `cluster_context` run
    pub cluster_run: String,
    /// Overrides `normalization.taxonomy_path`
    pub taxonomy: Option<PathBuf>,
}

#[derive(Serialize)]
struct NormalizeRunConfig<'a> {
    normalization: &'a NormalizationConfig,
    service: ServiceSnapshot,
    taxonomy_version: &'a str,
}

pub async fn run_normalize_global(ctx: &StageContext, args: &NormalizeArgs) -> Result<StageReport> {
    let config = NormalizationConfig::from_section(&ctx.config.normalization, &ctx.config.service.model)?;
    let taxonomy_path = args
        .taxonomy
        .clone()
        .or_else(|| ctx.config.normalization.taxonomy_path.clone())
        .ok_or_else(|| Error::Config("No taxonomy file given (--taxonomy or normalization.taxonomy_path)".to_string()))?;
    let taxonomy = Taxonomy::load(&taxonomy_path)?;

    let cluster_run = ResolvedRun::resolve(&ctx.registry, &args.cluster_run).await?;
    cluster_run.expect_stage(&[Stage::ClusterContext])?;
    let clusters: Vec<Cluster> = cluster_run.read_rows("clusters")?;

    let snapshot = NormalizeRunConfig {
        normalization: &config,
        service: ServiceSnapshot::from_config(&ctx.config),
        taxonomy_version: &taxonomy.version,
    };
    let mut draft = ManifestDraft::new(Stage::NormalizeGlobal, &ctx.code_version, &snapshot)?;
    draft.set_prompt_hash(config.template_sha256.clone());
    draft.set_taxonomy_version(taxonomy.version.clone());
    draft.add_upstream("cluster", cluster_run.run_id());
    draft.add_input(cluster_run.input_artifact("clusters")?);
    draft.add_input(file_input("taxonomy", &taxonomy_path, Some(taxonomy.families.len() as u64))?);

    let run_dir = RunDir::create(&ctx.root, draft.run_id())?;
    let log = TraceLog::create(&run_dir.file(CALLS_FILE), &run_dir.file(PARSE_OUTCOMES_FILE))?;
    let invoker = ctx.invoker();
    tracing::info!(
        run_id = %draft.run_id(),
        clusters = clusters.len(),
        taxonomy_version = %taxonomy.version,
        "Cross-context normalization"
    );

    let deadline = ctx.deadline();
    let outcome = normalize(
        &config,
        &invoker,
        &log,
        &taxonomy,
        &clusters,
        ctx.concurrency(),
        deadline.token(),
    )
    .await?;

    run_dir.write_rows(&mut draft, "global_issues", GLOBAL_ISSUES_FILE, &outcome.instances)?;
    run_dir.write_rows(&mut draft, "unassigned", UNASSIGNED_FILE, &outcome.unassigned)?;
    run_dir.write_rows(&mut draft, "batches", BATCHES_FILE, &outcome.batches)?;

    let skipped = outcome.skipped_batches();
    draft.set_count("clusters", clusters.len() as u64);
    draft.set_count("batches", outcome.batches.len() as u64);
    draft.set_count("skipped", skipped as u64);
    draft.set_count("global_issues", outcome.instances.len() as u64);
    draft.set_count("new_labels", outcome.instances.iter().filter(|i| i.is_new_label).count() as u64);
    draft.set_count("unassigned", outcome.unassigned.len() as u64);

    let usage = close_call_log(&run_dir, &mut draft, &log, invoker.ledger())?;
    ctx.finalize(&run_dir, draft, usage, status_for(skipped)).await
}
