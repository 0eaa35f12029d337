//! Run manifests
//!
//! Every stage invocation writes exactly one `manifest.json` into its run
//! directory. The manifest is the sole unit of provenance: downstream stages
//! reference their inputs by `run_id` and re-check the hashes recorded here.
//!
//! Serialization is deterministic (sorted maps, artifacts sorted by role),
//! so two runs over identical inputs and configuration differ only in
//! `run_id`, timestamps, and measured usage. `reproducibility_key` captures
//! the part that must be identical.

use crate::hash::{hash_file, hash_json, hash_parts};
use crate::jsonl::{read_json, write_json_atomic};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use uuid::Uuid;

/// Manifest format version
pub const MANIFEST_SCHEMA_VERSION: u32 = 1;

/// File name of the manifest inside a run directory
pub const MANIFEST_FILE: &str = "manifest.json";

/// Pipeline stage that produced a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Sample,
    ClassifyBenchmark,
    ClassifyFullCorpus,
    Gate,
    ClusterContext,
    NormalizeGlobal,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Sample => "sample",
            Stage::ClassifyBenchmark => "classify_benchmark",
            Stage::ClassifyFullCorpus => "classify_full_corpus",
            Stage::Gate => "gate",
            Stage::ClusterContext => "cluster_context",
            Stage::NormalizeGlobal => "normalize_global",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            Stage::Sample,
            Stage::ClassifyBenchmark,
            Stage::ClassifyFullCorpus,
            Stage::Gate,
            Stage::ClusterContext,
            Stage::NormalizeGlobal,
        ]
        .into_iter()
        .find(|stage| stage.as_str() == s)
    }

    /// Short prefix used in generated run ids
    fn slug(self) -> &'static str {
        match self {
            Stage::Sample => "sample",
            Stage::ClassifyBenchmark => "bench",
            Stage::ClassifyFullCorpus => "classify",
            Stage::Gate => "gate",
            Stage::ClusterContext => "cluster",
            Stage::NormalizeGlobal => "normalize",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generate a fresh, globally unique run id for a stage invocation
pub fn new_run_id(stage: Stage) -> String {
    format!("{}-{}", stage.slug(), Uuid::new_v4().simple())
}

/// Whether a run finished its whole work list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// Stage timeout fired; unscheduled work was skipped
    Partial,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Partial => "partial",
        }
    }
}

/// Identity of an input or output artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub role: String,
    /// Output artifacts: path relative to the run directory
    pub path: String,
    pub sha256: String,
    pub row_count: Option<u64>,
}

impl ArtifactRecord {
    /// Hash a file on disk and describe it
    pub fn from_file(
        role: impl Into<String>,
        file: &Path,
        recorded_path: impl Into<String>,
        row_count: Option<u64>,
    ) -> Result<Self> {
        Ok(Self {
            role: role.into(),
            path: recorded_path.into(),
            sha256: hash_file(file)?,
            row_count,
        })
    }
}

/// Aggregated cost and latency of external calls in a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub calls: u64,
    pub attempts: u64,
    pub retries: u64,
    pub failed_calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Calls whose token counts came from the local tokenizer
    pub estimated_token_calls: u64,
    pub total_latency_ms: u64,
    pub mean_latency_ms: f64,
    pub cost_usd: f64,
}

/// Provenance record of one stage invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: u32,
    pub run_id: String,
    pub stage: Stage,
    pub code_version: String,
    /// Full configuration snapshot used by the stage (secrets omitted)
    pub configuration: serde_json::Value,
    pub configuration_hash: String,
    pub prompt_hash: Option<String>,
    pub taxonomy_version: Option<String>,
    pub input_artifacts: Vec<ArtifactRecord>,
    pub output_artifacts: Vec<ArtifactRecord>,
    pub upstream_run_ids: BTreeMap<String, String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counts: BTreeMap<String, u64>,
    pub usage: UsageSummary,
    pub status: RunStatus,
    pub reproducibility_key: String,
}

impl RunManifest {
    /// Write `manifest.json` atomically into `run_dir`
    pub fn write(&self, run_dir: &Path) -> Result<()> {
        write_json_atomic(&run_dir.join(MANIFEST_FILE), self)
    }

    /// Load the manifest of a run directory
    pub fn load(run_dir: &Path) -> Result<Self> {
        let manifest: RunManifest = read_json(&run_dir.join(MANIFEST_FILE))?;
        if manifest.schema_version != MANIFEST_SCHEMA_VERSION {
            return Err(Error::InvalidInput(format!(
                "Unsupported manifest schema version {} in {}",
                manifest.schema_version,
                run_dir.display()
            )));
        }
        Ok(manifest)
    }

    pub fn output(&self, role: &str) -> Option<&ArtifactRecord> {
        self.output_artifacts.iter().find(|a| a.role == role)
    }

    pub fn count(&self, key: &str) -> u64 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    /// Re-hash a recorded output artifact and compare
    ///
    /// Returns the artifact's absolute path on success.
    pub fn verify_output(&self, run_dir: &Path, role: &str) -> Result<std::path::PathBuf> {
        let artifact = self.output(role).ok_or_else(|| {
            Error::Precondition(format!(
                "Run {} has no output artifact '{}'",
                self.run_id, role
            ))
        })?;
        let path = run_dir.join(&artifact.path);
        let actual = hash_file(&path)?;
        if actual != artifact.sha256 {
            return Err(Error::Precondition(format!(
                "Artifact '{}' of run {} was modified: manifest sha256 {} but file is {}",
                role, self.run_id, artifact.sha256, actual
            )));
        }
        Ok(path)
    }
}

/// Manifest under construction while a stage runs
#[derive(Debug, Clone)]
pub struct ManifestDraft {
    run_id: String,
    stage: Stage,
    code_version: String,
    configuration: serde_json::Value,
    configuration_hash: String,
    prompt_hash: Option<String>,
    taxonomy_version: Option<String>,
    input_artifacts: Vec<ArtifactRecord>,
    output_artifacts: Vec<ArtifactRecord>,
    upstream_run_ids: BTreeMap<String, String>,
    started_at: DateTime<Utc>,
    counts: BTreeMap<String, u64>,
}

impl ManifestDraft {
    pub fn new<C: Serialize>(stage: Stage, code_version: &str, configuration: &C) -> Result<Self> {
        let configuration = serde_json::to_value(configuration)?;
        let configuration_hash = hash_json(&configuration)?;
        Ok(Self {
            run_id: new_run_id(stage),
            stage,
            code_version: code_version.to_string(),
            configuration,
            configuration_hash,
            prompt_hash: None,
            taxonomy_version: None,
            input_artifacts: Vec::new(),
            output_artifacts: Vec::new(),
            upstream_run_ids: BTreeMap::new(),
            started_at: crate::time::now(),
            counts: BTreeMap::new(),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn configuration_hash(&self) -> &str {
        &self.configuration_hash
    }

    pub fn set_prompt_hash(&mut self, hash: impl Into<String>) {
        self.prompt_hash = Some(hash.into());
    }

    pub fn set_taxonomy_version(&mut self, version: impl Into<String>) {
        self.taxonomy_version = Some(version.into());
    }

    pub fn add_input(&mut self, artifact: ArtifactRecord) {
        self.input_artifacts.push(artifact);
    }

    pub fn add_output(&mut self, artifact: ArtifactRecord) {
        self.output_artifacts.push(artifact);
    }

    pub fn add_upstream(&mut self, role: impl Into<String>, run_id: impl Into<String>) {
        self.upstream_run_ids.insert(role.into(), run_id.into());
    }

    pub fn set_count(&mut self, key: impl Into<String>, value: u64) {
        self.counts.insert(key.into(), value);
    }

    pub fn finish(mut self, usage: UsageSummary, status: RunStatus) -> RunManifest {
        self.input_artifacts.sort_by(|a, b| a.role.cmp(&b.role));
        self.output_artifacts.sort_by(|a, b| a.role.cmp(&b.role));

        let reproducibility_key = reproducibility_key(
            self.stage,
            &self.configuration_hash,
            &self.input_artifacts,
            &self.upstream_run_ids,
        );

        RunManifest {
            schema_version: MANIFEST_SCHEMA_VERSION,
            run_id: self.run_id,
            stage: self.stage,
            code_version: self.code_version,
            configuration: self.configuration,
            configuration_hash: self.configuration_hash,
            prompt_hash: self.prompt_hash,
            taxonomy_version: self.taxonomy_version,
            input_artifacts: self.input_artifacts,
            output_artifacts: self.output_artifacts,
            upstream_run_ids: self.upstream_run_ids,
            started_at: self.started_at,
            finished_at: crate::time::now(),
            counts: self.counts,
            usage,
            status,
            reproducibility_key,
        }
    }
}

/// Hash of everything that determines a run's inputs
///
/// Stage, configuration hash, every input artifact (role + content hash),
/// and every upstream run id. Input order does not matter.
pub fn reproducibility_key(
    stage: Stage,
    configuration_hash: &str,
    inputs: &[ArtifactRecord],
    upstream: &BTreeMap<String, String>,
) -> String {
    let mut sorted: Vec<&ArtifactRecord> = inputs.iter().collect();
    sorted.sort_by(|a, b| a.role.cmp(&b.role).then(a.sha256.cmp(&b.sha256)));

    let mut parts: Vec<String> = vec![stage.as_str().to_string(), configuration_hash.to_string()];
    for artifact in sorted {
        parts.push(format!("input:{}={}", artifact.role, artifact.sha256));
    }
    for (role, run_id) in upstream {
        parts.push(format!("upstream:{}={}", role, run_id));
    }
    hash_parts(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn artifact(role: &str, sha: &str) -> ArtifactRecord {
        ArtifactRecord {
            role: role.to_string(),
            path: format!("{}.jsonl", role),
            sha256: sha.to_string(),
            row_count: Some(1),
        }
    }

    #[test]
    fn test_run_ids_are_unique_and_prefixed() {
        let a = new_run_id(Stage::ClassifyBenchmark);
        let b = new_run_id(Stage::ClassifyBenchmark);
        assert_ne!(a, b);
        assert!(a.starts_with("bench-"));
    }

    #[test]
    fn test_stage_parse_roundtrip() {
        for stage in [Stage::Sample, Stage::Gate, Stage::NormalizeGlobal] {
            assert_eq!(Stage::parse(stage.as_str()), Some(stage));
        }
        assert_eq!(Stage::parse("latest"), None);
    }

    #[test]
    fn test_reproducibility_key_ignores_input_order() {
        let upstream = BTreeMap::new();
        let k1 = reproducibility_key(Stage::Sample, "h", &[artifact("a", "1"), artifact("b", "2")], &upstream);
        let k2 = reproducibility_key(Stage::Sample, "h", &[artifact("b", "2"), artifact("a", "1")], &upstream);
        assert_eq!(k1, k2);
        let k3 = reproducibility_key(Stage::Sample, "h2", &[artifact("a", "1")], &upstream);
        assert_ne!(k1, k3);
    }

    #[test]
    fn test_identical_drafts_share_key_but_not_run_id() {
        let config = json!({"seed": 7});
        let mut d1 = ManifestDraft::new(Stage::Sample, "0.1.0", &config).unwrap();
        let mut d2 = ManifestDraft::new(Stage::Sample, "0.1.0", &config).unwrap();
        d1.add_input(artifact("corpus", "abc"));
        d2.add_input(artifact("corpus", "abc"));
        let m1 = d1.finish(UsageSummary::default(), RunStatus::Completed);
        let m2 = d2.finish(UsageSummary::default(), RunStatus::Completed);
        assert_ne!(m1.run_id, m2.run_id);
        assert_eq!(m1.reproducibility_key, m2.reproducibility_key);
        assert_eq!(m1.configuration_hash, m2.configuration_hash);
    }

    #[test]
    fn test_write_load_and_verify_output() {
        let dir = TempDir::new().unwrap();
        let table = dir.path().join("rows.jsonl");
        std::fs::write(&table, "{}\n").unwrap();

        let mut draft = ManifestDraft::new(Stage::Sample, "0.1.0", &json!({})).unwrap();
        draft.add_output(ArtifactRecord::from_file("rows", &table, "rows.jsonl", Some(1)).unwrap());
        draft.set_count("selected", 1);
        let manifest = draft.finish(UsageSummary::default(), RunStatus::Completed);
        manifest.write(dir.path()).unwrap();

        let loaded = RunManifest::load(dir.path()).unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(loaded.count("selected"), 1);
        assert!(loaded.verify_output(dir.path(), "rows").is_ok());

        std::fs::write(&table, "{\"tampered\":true}\n").unwrap();
        let err = loaded.verify_output(dir.path(), "rows").unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
    }
}
