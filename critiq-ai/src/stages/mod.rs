//! Stage orchestration
//!
//! Each stage resolves and verifies its upstream runs, creates a fresh run
//! directory, does its work under an optional deadline, writes its tables,
//! then writes and registers exactly one manifest.

pub mod classify;
pub mod cluster;
pub mod gate;
pub mod normalize;
pub mod runs;
pub mod sample;

pub use classify::{run_classify_benchmark, run_classify_full_corpus, BenchmarkArgs, FullCorpusArgs};
pub use cluster::{run_cluster_context, ClusterArgs};
pub use gate::{run_gate, GateArgs};
pub use normalize::{run_normalize_global, NormalizeArgs};
pub use runs::{list_runs, show_run, verify_run, VerifyReport};
pub use sample::{run_sample, SampleArgs};

use crate::run::{RunDir, TraceLog, CALLS_FILE, PARSE_OUTCOMES_FILE};
use crate::service::{CostModel, GenerationService, RetryPolicy, ServiceInvoker, UsageLedger};
use critiq_common::config::CritiqConfig;
use critiq_common::db::Registry;
use critiq_common::manifest::{ArtifactRecord, ManifestDraft, RunManifest, RunStatus, UsageSummary};
use critiq_common::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Version string recorded in every manifest
///
/// `<crate version>+<commit>.<profile>`, e.g. `0.1.0+1a2b3c4d.release`.
pub fn code_version() -> String {
    format!(
        "{}+{}.{}",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_PROFILE")
    )
}

/// Shared state of one stage invocation
pub struct StageContext {
    pub config: CritiqConfig,
    pub root: PathBuf,
    pub registry: Registry,
    pub service: Arc<dyn GenerationService>,
    /// Overrides `stage.timeout_secs` when set
    pub stage_timeout: Option<Duration>,
    pub code_version: String,
}

impl StageContext {
    pub fn new(config: CritiqConfig, root: PathBuf, registry: Registry, service: Arc<dyn GenerationService>) -> Self {
        Self {
            config,
            root,
            registry,
            service,
            stage_timeout: None,
            code_version: code_version(),
        }
    }

    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout = Some(timeout);
        self
    }

    /// Invoker with a fresh usage ledger
    pub fn invoker(&self) -> ServiceInvoker {
        ServiceInvoker::new(
            Arc::clone(&self.service),
            RetryPolicy::from_config(&self.config.service),
            CostModel::from_config(&self.config.service),
        )
    }

    pub fn concurrency(&self) -> usize {
        self.config.service.concurrency.max(1)
    }

    fn timeout(&self) -> Option<Duration> {
        self.stage_timeout.or_else(|| match self.config.stage.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        })
    }

    /// Start the stage deadline timer
    pub fn deadline(&self) -> StageDeadline {
        StageDeadline::start(self.timeout())
    }

    /// Write the manifest into the run directory and register it
    pub async fn finalize(
        &self,
        run_dir: &RunDir,
        draft: ManifestDraft,
        usage: UsageSummary,
        status: RunStatus,
    ) -> Result<StageReport> {
        let manifest = draft.finish(usage, status);
        manifest.write(run_dir.path())?;
        self.registry.register_run(&manifest, run_dir.path()).await?;

        tracing::info!(
            run_id = %manifest.run_id,
            stage = %manifest.stage,
            status = manifest.status.as_str(),
            calls = manifest.usage.calls,
            cost_usd = manifest.usage.cost_usd,
            "Stage complete"
        );
        Ok(StageReport {
            run_dir: run_dir.path().to_path_buf(),
            manifest,
        })
    }
}

/// Finished stage: its manifest and where it lives
#[derive(Debug, Clone)]
pub struct StageReport {
    pub run_dir: PathBuf,
    pub manifest: RunManifest,
}

/// Cancels a token once the stage timeout elapses
pub struct StageDeadline {
    token: CancellationToken,
    timer: Option<JoinHandle<()>>,
}

impl StageDeadline {
    pub fn start(timeout: Option<Duration>) -> Self {
        let token = CancellationToken::new();
        let timer = timeout.map(|timeout| {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                tracing::warn!(timeout_ms = timeout.as_millis() as u64, "Stage timeout reached, skipping unstarted work");
                token.cancel();
            })
        });
        Self { token, timer }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for StageDeadline {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Service settings that shape outputs; secrets and throughput knobs excluded
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub base_url: String,
    pub model: String,
}

impl ServiceSnapshot {
    pub fn from_config(config: &CritiqConfig) -> Self {
        Self {
            base_url: config.service.base_url.clone(),
            model: config.service.model.clone(),
        }
    }
}

/// Record an input file given by path
pub fn file_input(role: &str, path: &Path, row_count: Option<u64>) -> Result<ArtifactRecord> {
    ArtifactRecord::from_file(role, path, path.to_string_lossy().to_string(), row_count)
}

/// Record the call and parse logs as outputs and hand back the ledger summary
pub fn close_call_log(
    run_dir: &RunDir,
    draft: &mut ManifestDraft,
    log: &TraceLog,
    ledger: &UsageLedger,
) -> Result<UsageSummary> {
    run_dir.record_existing(draft, "calls", CALLS_FILE, Some(log.rows()))?;
    run_dir.record_existing(draft, "parse_outcomes", PARSE_OUTCOMES_FILE, Some(log.parse_rows()))?;
    Ok(ledger.summary())
}

pub(crate) fn status_for(skipped: usize) -> RunStatus {
    if skipped > 0 {
        RunStatus::Partial
    } else {
        RunStatus::Completed
    }
}
