//! `cluster-context` stage

use super::{close_call_log, status_for, ServiceSnapshot, StageContext, StageReport};
use crate::cluster::{cluster_contexts, ClusteringConfig, ContextStatus};
use crate::run::{ResolvedRun, RunDir, TraceLog, CALLS_FILE, CLUSTERS_FILE, CONTEXTS_FILE, PARSE_OUTCOMES_FILE};
use critiq_common::manifest::{ManifestDraft, Stage};
use critiq_common::schema::{Cluster, PredictionRecord};
use critiq_common::Result;
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct ClusterArgs {
    /// Run id or directory of a classify run
    pub classify_run: String,
}

#[derive(Serialize)]
struct ClusterRunConfig<'a> {
    clustering: &'a ClusteringConfig,
    service: ServiceSnapshot,
}

pub async fn run_cluster_context(ctx: &StageContext, args: &ClusterArgs) -> Result<StageReport> {
    let config = ClusteringConfig::from_section(&ctx.config.clustering, &ctx.config.service.model)?;

    let classify_run = ResolvedRun::resolve(&ctx.registry, &args.classify_run).await?;
    classify_run.expect_stage(&[Stage::ClassifyFullCorpus, Stage::ClassifyBenchmark])?;
    let predictions: Vec<PredictionRecord> = classify_run.read_rows("predictions")?;

    let snapshot = ClusterRunConfig {
        clustering: &config,
        service: ServiceSnapshot::from_config(&ctx.config),
    };
    let mut draft = ManifestDraft::new(Stage::ClusterContext, &ctx.code_version, &snapshot)?;
    draft.set_prompt_hash(config.template_sha256.clone());
    draft.add_upstream("classify", classify_run.run_id());
    draft.add_input(classify_run.input_artifact("predictions")?);

    let run_dir = RunDir::create(&ctx.root, draft.run_id())?;
    let log = TraceLog::create(&run_dir.file(CALLS_FILE), &run_dir.file(PARSE_OUTCOMES_FILE))?;
    let invoker = ctx.invoker();

    let deadline = ctx.deadline();
    let outcomes = cluster_contexts(&config, &invoker, &log, &predictions, ctx.concurrency(), deadline.token()).await?;

    let mut clusters: Vec<Cluster> = Vec::new();
    let mut records = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        clusters.extend(outcome.clusters);
        records.push(outcome.record);
    }
    clusters.sort_by_key(|c| c.key());

    let status_count = |status: ContextStatus| records.iter().filter(|r| r.status == status).count();
    let skipped = status_count(ContextStatus::Skipped);
    draft.set_count("contexts", records.len() as u64);
    draft.set_count("contexts_clustered", status_count(ContextStatus::Clustered) as u64);
    draft.set_count("contexts_service_failure", status_count(ContextStatus::ServiceFailure) as u64);
    draft.set_count("contexts_parse_error", status_count(ContextStatus::ParseError) as u64);
    draft.set_count("contexts_schema_error", status_count(ContextStatus::SchemaError) as u64);
    draft.set_count("skipped", skipped as u64);
    draft.set_count("clusters", clusters.len() as u64);
    draft.set_count(
        "unclustered_items",
        records.iter().map(|r| r.unclustered_item_ids.len() as u64).sum(),
    );

    run_dir.write_rows(&mut draft, "clusters", CLUSTERS_FILE, &clusters)?;
    run_dir.write_rows(&mut draft, "contexts", CONTEXTS_FILE, &records)?;

    let usage = close_call_log(&run_dir, &mut draft, &log, invoker.ledger())?;
    ctx.finalize(&run_dir, draft, usage, status_for(skipped)).await
}
