//! Run directories and upstream run resolution
//!
//! `<root>/runs/<run_id>/` holds `manifest.json`, `calls.jsonl`,
//! `parse_outcomes.jsonl` and the stage's tables. Upstream runs are located
//! by explicit run id (registry lookup) or explicit directory path, never by
//! recency.

pub mod trace_log;

pub use trace_log::{MemorySink, ParseRecord, TraceLog, TraceSink};

use critiq_common::db::Registry;
use critiq_common::manifest::{ArtifactRecord, ManifestDraft, RunManifest, Stage, MANIFEST_FILE};
use critiq_common::{jsonl, Error, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

pub const RUNS_DIR: &str = "runs";
pub const CALLS_FILE: &str = "calls.jsonl";
pub const PARSE_OUTCOMES_FILE: &str = "parse_outcomes.jsonl";
pub const SPLIT_A_FILE: &str = "split_a.jsonl";
pub const SPLIT_B_FILE: &str = "split_b.jsonl";
pub const SAMPLE_REPORT_FILE: &str = "sample_report.json";
pub const PREDICTIONS_FILE: &str = "predictions.jsonl";
pub const SCORED_FILE: &str = "scored.jsonl";
pub const METRICS_FILE: &str = "metrics.json";
pub const DECISION_FILE: &str = "decision.json";
pub const CLUSTERS_FILE: &str = "clusters.jsonl";
pub const CONTEXTS_FILE: &str = "contexts.jsonl";
pub const GLOBAL_ISSUES_FILE: &str = "global_issues.jsonl";
pub const UNASSIGNED_FILE: &str = "unassigned.jsonl";
pub const BATCHES_FILE: &str = "batches.jsonl";

/// Output directory of one stage invocation
#[derive(Debug, Clone)]
pub struct RunDir {
    path: PathBuf,
}

impl RunDir {
    /// Create `<root>/runs/<run_id>/`; an existing directory is an error
    pub fn create(root: &Path, run_id: &str) -> Result<Self> {
        let runs = root.join(RUNS_DIR);
        std::fs::create_dir_all(&runs)?;
        let path = runs.join(run_id);
        std::fs::create_dir(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                Error::Precondition(format!("Run directory {} already exists", path.display()))
            } else {
                Error::Io(e)
            }
        })?;
        tracing::debug!(run_dir = %path.display(), "Created run directory");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Write a JSONL table and record it as an output artifact
    pub fn write_rows<T: Serialize>(
        &self,
        draft: &mut ManifestDraft,
        role: &str,
        file_name: &str,
        rows: &[T],
    ) -> Result<u64> {
        let path = self.file(file_name);
        let count = jsonl::write_rows(&path, rows)?;
        draft.add_output(ArtifactRecord::from_file(role, &path, file_name, Some(count))?);
        Ok(count)
    }

    /// Write a JSON document and record it as an output artifact
    pub fn write_json<T: Serialize>(
        &self,
        draft: &mut ManifestDraft,
        role: &str,
        file_name: &str,
        value: &T,
    ) -> Result<()> {
        let path = self.file(file_name);
        jsonl::write_json_atomic(&path, value)?;
        draft.add_output(ArtifactRecord::from_file(role, &path, file_name, None)?);
        Ok(())
    }

    /// Record an already-written file (the call log) as an output artifact
    pub fn record_existing(
        &self,
        draft: &mut ManifestDraft,
        role: &str,
        file_name: &str,
        row_count: Option<u64>,
    ) -> Result<()> {
        let path = self.file(file_name);
        draft.add_output(ArtifactRecord::from_file(role, &path, file_name, row_count)?);
        Ok(())
    }
}

/// A finished upstream run, located and loaded
#[derive(Debug, Clone)]
pub struct ResolvedRun {
    pub run_dir: PathBuf,
    pub manifest: RunManifest,
}

impl ResolvedRun {
    /// Locate a run by directory path or by registered run id
    pub async fn resolve(registry: &Registry, locator: &str) -> Result<Self> {
        let as_path = Path::new(locator);
        let run_dir = if as_path.join(MANIFEST_FILE).is_file() {
            as_path.to_path_buf()
        } else {
            let entry = registry.lookup_run(locator).await?.ok_or_else(|| {
                Error::NotFound(format!("Run '{}' is not a run directory or registered run id", locator))
            })?;
            entry.run_dir
        };

        let manifest = RunManifest::load(&run_dir)?;
        if !as_path.join(MANIFEST_FILE).is_file() && manifest.run_id != locator {
            return Err(Error::Precondition(format!(
                "Registry maps {} to {}, whose manifest is for run {}",
                locator,
                run_dir.display(),
                manifest.run_id
            )));
        }
        Ok(Self { run_dir, manifest })
    }

    pub fn run_id(&self) -> &str {
        &self.manifest.run_id
    }

    /// Fail unless the run came from one of `stages`
    pub fn expect_stage(&self, stages: &[Stage]) -> Result<()> {
        if stages.contains(&self.manifest.stage) {
            return Ok(());
        }
        let expected: Vec<&str> = stages.iter().map(|s| s.as_str()).collect();
        Err(Error::Precondition(format!(
            "Run {} is a {} run; expected {}",
            self.manifest.run_id,
            self.manifest.stage,
            expected.join(" or ")
        )))
    }

    /// Path of an output artifact whose content still matches its manifest hash
    pub fn verified_output(&self, role: &str) -> Result<PathBuf> {
        self.manifest.verify_output(&self.run_dir, role)
    }

    /// Read a verified JSONL output table
    pub fn read_rows<T: serde::de::DeserializeOwned>(&self, role: &str) -> Result<Vec<T>> {
        let path = self.verified_output(role)?;
        jsonl::read_rows(&path)
    }

    /// Re-hash every output artifact; returns `(role, ok)` per artifact
    pub fn verify_all(&self) -> Vec<(String, Result<()>)> {
        self.manifest
            .output_artifacts
            .iter()
            .map(|artifact| {
                let result = self.verified_output(&artifact.role).map(|_| ());
                (artifact.role.clone(), result)
            })
            .collect()
    }

    /// Describe this run's output table as an input to a downstream stage
    pub fn input_artifact(&self, role: &str) -> Result<ArtifactRecord> {
        let artifact = self.manifest.output(role).ok_or_else(|| {
            Error::Precondition(format!("Run {} has no output '{}'", self.manifest.run_id, role))
        })?;
        Ok(ArtifactRecord {
            role: format!("{}.{}", self.manifest.stage, role),
            path: self.run_dir.join(&artifact.path).to_string_lossy().to_string(),
            sha256: artifact.sha256.clone(),
            row_count: artifact.row_count,
        })
    }
}
