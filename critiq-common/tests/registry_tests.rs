//! Run registry persistence

use critiq_common::db::{Registry, REGISTRY_FILE};
use critiq_common::manifest::{ManifestDraft, RunStatus, Stage, UsageSummary};
use critiq_common::Error;
use serde_json::json;
use tempfile::TempDir;

fn finished(stage: Stage, upstream: Option<(&str, &str)>) -> critiq_common::RunManifest {
    let mut draft = ManifestDraft::new(stage, "test", &json!({"k": 1})).unwrap();
    if let Some((role, id)) = upstream {
        draft.add_upstream(role, id);
    }
    draft.finish(UsageSummary::default(), RunStatus::Completed)
}

#[tokio::test]
async fn test_register_and_lookup() {
    let dir = TempDir::new().unwrap();
    let registry = Registry::open(dir.path()).await.unwrap();
    assert!(dir.path().join(REGISTRY_FILE).exists());

    let manifest = finished(Stage::ClassifyBenchmark, Some(("sample", "sample-abc")));
    let run_dir = dir.path().join("runs").join(&manifest.run_id);
    registry.register_run(&manifest, &run_dir).await.unwrap();

    let entry = registry.lookup_run(&manifest.run_id).await.unwrap().unwrap();
    assert_eq!(entry.stage, Stage::ClassifyBenchmark);
    assert_eq!(entry.run_dir, run_dir);
    assert_eq!(entry.status, "completed");
    assert_eq!(entry.configuration_hash, manifest.configuration_hash);
    assert_eq!(entry.reproducibility_key, manifest.reproducibility_key);
    assert_eq!(entry.upstream_run_ids.get("sample").map(String::as_str), Some("sample-abc"));
}

#[tokio::test]
async fn test_lookup_unknown_run_is_none() {
    let dir = TempDir::new().unwrap();
    let registry = Registry::open(dir.path()).await.unwrap();
    assert!(registry.lookup_run("gate-missing").await.unwrap().is_none());
}

#[tokio::test]
async fn test_duplicate_registration_rejected() {
    let dir = TempDir::new().unwrap();
    let registry = Registry::open(dir.path()).await.unwrap();
    let manifest = finished(Stage::Sample, None);

    registry.register_run(&manifest, dir.path()).await.unwrap();
    let second = registry.register_run(&manifest, dir.path()).await;
    assert!(matches!(second, Err(Error::Precondition(_))));
}

#[tokio::test]
async fn test_list_runs_filters_by_stage() {
    let dir = TempDir::new().unwrap();
    let registry = Registry::open(dir.path()).await.unwrap();

    for stage in [Stage::Sample, Stage::Gate, Stage::Sample] {
        let manifest = finished(stage, None);
        registry.register_run(&manifest, dir.path()).await.unwrap();
    }

    assert_eq!(registry.list_runs(None).await.unwrap().len(), 3);
    let samples = registry.list_runs(Some(Stage::Sample)).await.unwrap();
    assert_eq!(samples.len(), 2);
    assert!(samples.iter().all(|e| e.stage == Stage::Sample));
}

#[tokio::test]
async fn test_registry_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let manifest = finished(Stage::NormalizeGlobal, None);
    {
        let registry = Registry::open(dir.path()).await.unwrap();
        registry.register_run(&manifest, dir.path()).await.unwrap();
    }
    let registry = Registry::open(dir.path()).await.unwrap();
    assert!(registry.lookup_run(&manifest.run_id).await.unwrap().is_some());
}
