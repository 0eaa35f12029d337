//! End-to-end stage tests with scripted services

mod helpers;

use critiq_ai::benchmark::Metrics;
use critiq_ai::gate::{GateDecision, Verdict};
use critiq_ai::run::{CLUSTERS_FILE, DECISION_FILE, GLOBAL_ISSUES_FILE, METRICS_FILE, SPLIT_A_FILE, SPLIT_B_FILE, UNASSIGNED_FILE};
use critiq_ai::sampler::{SampleTargets, Split};
use critiq_ai::service::ScriptedService;
use critiq_ai::stages::{self, StageContext, StageReport};
use critiq_common::manifest::{RunStatus, Stage};
use critiq_common::schema::{Cluster, ClusterKey, GlobalIssueInstance, Item, UnassignedCluster, UnassignedReason};
use critiq_common::{jsonl, Error};
use helpers::*;
use std::collections::BTreeSet;

async fn sample_run(ws: &Workspace, ctx: &StageContext, total: usize) -> StageReport {
    let corpus_path = ws.write_rows("corpus.jsonl", &corpus(60));
    let args = stages::SampleArgs {
        corpus: corpus_path,
        seed: 42,
        targets: SampleTargets::Total(total),
        focus_context: None,
    };
    stages::run_sample(ctx, &args).await.unwrap()
}

async fn benchmark(ws: &Workspace, ctx: &StageContext, sample: &StageReport) -> StageReport {
    let split_a: Vec<Item> = jsonl::read_rows(&sample.run_dir.join(SPLIT_A_FILE)).unwrap();
    let gold_path = ws.write_rows("gold.jsonl", &gold(&split_a, "A"));
    let args = stages::BenchmarkArgs {
        sample_run: sample.manifest.run_id.clone(),
        split: Split::A,
        gold: gold_path,
    };
    stages::run_classify_benchmark(ctx, &args).await.unwrap()
}

#[tokio::test]
async fn test_sample_is_deterministic_and_disjoint() {
    let ws = Workspace::new();
    let ctx = ws.context("v1", classifier(false)).await;

    let first = sample_run(&ws, &ctx, 40).await;
    let second = sample_run(&ws, &ctx, 40).await;
    assert_ne!(first.manifest.run_id, second.manifest.run_id);

    for file in [SPLIT_A_FILE, SPLIT_B_FILE] {
        let a = std::fs::read(first.run_dir.join(file)).unwrap();
        let b = std::fs::read(second.run_dir.join(file)).unwrap();
        assert_eq!(a, b, "{} differs between identical sample runs", file);
    }

    let split_a: Vec<Item> = jsonl::read_rows(&first.run_dir.join(SPLIT_A_FILE)).unwrap();
    let split_b: Vec<Item> = jsonl::read_rows(&first.run_dir.join(SPLIT_B_FILE)).unwrap();
    assert_eq!(split_a.len() + split_b.len(), 40);
    let ids_a: BTreeSet<&str> = split_a.iter().map(|i| i.item_id.as_str()).collect();
    assert!(split_b.iter().all(|i| !ids_a.contains(i.item_id.as_str())));

    assert_eq!(first.manifest.reproducibility_key, second.manifest.reproducibility_key);
    assert_eq!(first.manifest.count("split_a") + first.manifest.count("split_b"), 40);
}

#[tokio::test]
async fn test_benchmark_metrics_account_for_every_example() {
    let ws = Workspace::new();
    let ctx = ws.context("v1", classifier(false)).await;
    let sample = sample_run(&ws, &ctx, 40).await;
    let bench = benchmark(&ws, &ctx, &sample).await;

    assert_eq!(bench.manifest.stage, Stage::ClassifyBenchmark);
    assert_eq!(bench.manifest.status, RunStatus::Completed);
    assert_eq!(bench.manifest.upstream_run_ids["sample"], sample.manifest.run_id);

    let metrics: Metrics = jsonl::read_json(&bench.run_dir.join(METRICS_FILE)).unwrap();
    let c = metrics.binary.counts;
    assert_eq!(c.tp + c.fp + c.fn_ + c.tn + metrics.excluded, metrics.num_examples);
    assert_eq!(metrics.num_examples, bench.manifest.count("items"));
    assert_eq!(metrics.binary.f1, 1.0);
    assert_eq!(metrics.parse_errors, 0);
    assert_eq!(bench.manifest.usage.calls, bench.manifest.count("items"));
}

#[tokio::test]
async fn test_gate_accepts_improvement_and_guards_full_corpus() {
    let ws = Workspace::new();
    let old_ctx = ws.context("v0", classifier(true)).await;
    let new_ctx = ws.context("v1", classifier(false)).await;

    let sample = sample_run(&ws, &new_ctx, 40).await;
    let old_bench = benchmark(&ws, &old_ctx, &sample).await;
    let new_bench = benchmark(&ws, &new_ctx, &sample).await;
    assert_ne!(old_bench.manifest.configuration_hash, new_bench.manifest.configuration_hash);

    let gate_args = stages::GateArgs {
        old_run: old_bench.manifest.run_id.clone(),
        new_run: new_bench.manifest.run_id.clone(),
        split: Split::A,
        alpha: None,
    };
    let gate = stages::run_gate(&new_ctx, &gate_args).await.unwrap();
    let decision: GateDecision = jsonl::read_json(&gate.run_dir.join(DECISION_FILE)).unwrap();
    assert_eq!(decision.b, 0);
    assert!(decision.c >= 6, "expected at least 6 discordant wins, got {}", decision.c);
    assert_eq!(decision.verdict, Verdict::Accept);

    let rerun = stages::run_gate(&new_ctx, &gate_args).await.unwrap();
    assert_eq!(
        std::fs::read(gate.run_dir.join(DECISION_FILE)).unwrap(),
        std::fs::read(rerun.run_dir.join(DECISION_FILE)).unwrap()
    );

    let corpus_path = ws.write_rows("full.jsonl", &corpus(12));
    let full_args = stages::FullCorpusArgs {
        corpus: corpus_path,
        gate_run: Some(gate.manifest.run_id.clone()),
    };
    let full = stages::run_classify_full_corpus(&new_ctx, &full_args).await.unwrap();
    assert_eq!(full.manifest.upstream_run_ids["gate"], gate.manifest.run_id);
    assert_eq!(full.manifest.configuration_hash, new_bench.manifest.configuration_hash);

    let err = stages::run_classify_full_corpus(&old_ctx, &full_args).await.unwrap_err();
    assert!(matches!(err, Error::Precondition(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_gate_rejects_split_mismatch() {
    let ws = Workspace::new();
    let ctx = ws.context("v1", classifier(false)).await;
    let sample = sample_run(&ws, &ctx, 40).await;
    let bench = benchmark(&ws, &ctx, &sample).await;

    let args = stages::GateArgs {
        old_run: bench.manifest.run_id.clone(),
        new_run: bench.manifest.run_id.clone(),
        split: Split::B,
        alpha: None,
    };
    let err = stages::run_gate(&ctx, &args).await.unwrap_err();
    assert!(matches!(err, Error::Precondition(_)));
}

#[tokio::test]
async fn test_cluster_and_normalize_cover_every_key() {
    let ws = Workspace::new();
    let classify_ctx = ws.context("v1", classifier(false)).await;
    let corpus_path = ws.write_rows("full.jsonl", &corpus(18));
    let full = stages::run_classify_full_corpus(
        &classify_ctx,
        &stages::FullCorpusArgs {
            corpus: corpus_path,
            gate_run: None,
        },
    )
    .await
    .unwrap();

    let cluster_ctx = ws.context("v1", clusterer()).await;
    let cluster_run = stages::run_cluster_context(
        &cluster_ctx,
        &stages::ClusterArgs {
            classify_run: full.manifest.run_id.clone(),
        },
    )
    .await
    .unwrap();
    assert_eq!(cluster_run.manifest.count("contexts_clustered"), 3);
    let clusters: Vec<Cluster> = jsonl::read_rows(&cluster_run.run_dir.join(CLUSTERS_FILE)).unwrap();
    assert_eq!(clusters.len(), 3);
    assert_eq!(
        clusters.iter().map(|c| c.member_count).sum::<usize>() as u64,
        full.manifest.count("accepted")
    );

    let taxonomy = ws.write_taxonomy();
    let normalize_ctx = ws.context("v1", normalizer()).await;
    let normalized = stages::run_normalize_global(
        &normalize_ctx,
        &stages::NormalizeArgs {
            cluster_run: cluster_run.run_dir.to_string_lossy().to_string(),
            taxonomy: Some(taxonomy),
        },
    )
    .await
    .unwrap();
    assert_eq!(normalized.manifest.taxonomy_version.as_deref(), Some("2024.1"));
    assert_eq!(normalized.manifest.count("batches"), 2);

    let instances: Vec<GlobalIssueInstance> =
        jsonl::read_rows(&normalized.run_dir.join(GLOBAL_ISSUES_FILE)).unwrap();
    let unassigned: Vec<UnassignedCluster> = jsonl::read_rows(&normalized.run_dir.join(UNASSIGNED_FILE)).unwrap();

    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].taxonomy_label, "Facilities");
    assert!(!instances[0].is_new_label);
    assert_eq!(instances[0].context_count, 2);
    assert_eq!(instances[0].description, "Rooms, equipment, lab hardware");
    assert_eq!(unassigned.len(), 1);
    assert_eq!(unassigned[0].key, ClusterKey::new("CS103", "CS103-1"));
    assert_eq!(unassigned[0].reason, UnassignedReason::DeclinedByService);

    let mut covered: Vec<ClusterKey> = instances
        .iter()
        .flat_map(|i| i.member_cluster_keys.iter().cloned())
        .chain(unassigned.iter().map(|u| u.key.clone()))
        .collect();
    covered.sort();
    let expected: Vec<ClusterKey> = clusters.iter().map(|c| c.key()).collect();
    assert_eq!(covered, expected);
    assert!(instances.iter().all(|i| i.taxonomy_version == "2024.1"));
    assert!(unassigned.iter().all(|u| u.taxonomy_version == "2024.1"));
}

#[tokio::test]
async fn test_cluster_stage_rejects_sample_run() {
    let ws = Workspace::new();
    let ctx = ws.context("v1", ScriptedService::always_text("{}")).await;
    let sample = sample_run(&ws, &ctx, 20).await;
    let err = stages::run_cluster_context(
        &ctx,
        &stages::ClusterArgs {
            classify_run: sample.manifest.run_id.clone(),
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Precondition(_)));
}
