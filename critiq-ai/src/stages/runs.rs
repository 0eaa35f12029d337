//! `runs show|verify|list`

use crate::run::ResolvedRun;
use critiq_common::db::{Registry, RegistryEntry};
use critiq_common::manifest::{RunManifest, Stage};
use critiq_common::Result;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactCheck {
    pub role: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub run_id: String,
    pub ok: bool,
    pub artifacts: Vec<ArtifactCheck>,
}

pub async fn show_run(registry: &Registry, locator: &str) -> Result<RunManifest> {
    Ok(ResolvedRun::resolve(registry, locator).await?.manifest)
}

/// Re-hash every output artifact of a run
pub async fn verify_run(registry: &Registry, locator: &str) -> Result<VerifyReport> {
    let run = ResolvedRun::resolve(registry, locator).await?;
    let artifacts: Vec<ArtifactCheck> = run
        .verify_all()
        .into_iter()
        .map(|(role, result)| ArtifactCheck {
            role,
            ok: result.is_ok(),
            error: result.err().map(|e| e.to_string()),
        })
        .collect();
    let ok = artifacts.iter().all(|a| a.ok);
    if !ok {
        tracing::warn!(run_id = %run.run_id(), "Run artifacts do not match their manifest");
    }
    Ok(VerifyReport {
        run_id: run.run_id().to_string(),
        ok,
        artifacts,
    })
}

pub async fn list_runs(registry: &Registry, stage: Option<Stage>) -> Result<Vec<RegistryEntry>> {
    registry.list_runs(stage).await
}
