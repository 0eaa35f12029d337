//! Cross-context normalization
//!
//! Clusters from every context are ordered, cut into fixed-size batches and
//! mapped onto the taxonomy one batch per call. Batch results are merged by
//! normalized label into global issue instances. Every input cluster key
//! ends up in exactly one instance or in the unassigned set.

pub mod batch;
pub mod merge;
pub mod validate;

pub use batch::{order_clusters, partition, render_batch, ClusterBatch};
pub use merge::{enforce_coverage, merge_groups};
pub use validate::{validate_batch, BatchAssignment, ProposedGroup};

use crate::parse::{extract_object, ParseOutcome};
use crate::prompt::PromptTemplate;
use crate::run::{ParseRecord, TraceSink};
use crate::service::{GenerationRequest, ServiceInvoker};
use critiq_common::config::NormalizationSection;
use critiq_common::schema::{
    Cluster, ClusterKey, GlobalIssueInstance, Taxonomy, UnassignedCluster, UnassignedReason,
};
use critiq_common::{Error, Result};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error as ThisError;
use tokio_util::sync::CancellationToken;

pub const NORMALIZATION_PLACEHOLDERS: &[&str] = &["taxonomy_version", "taxonomy", "clusters"];
const REQUIRED_PLACEHOLDERS: &[&str] = &["taxonomy", "clusters"];

pub const DEFAULT_NORMALIZATION_TEMPLATE: &str = r#"You map course-level issue clusters onto a shared taxonomy (version {{taxonomy_version}}).

Taxonomy labels:
{{taxonomy}}

Clusters, one JSON object per line:
{{clusters}}

Group clusters that describe the same issue. Use a taxonomy label when one
fits; otherwise propose a short new label. Put clusters that fit no group
under "unassigned". Mention every cluster exactly once.

Reply with a single JSON object and nothing else:
{"groups": [{"label": "<label>", "description": "<one sentence>",
             "members": [{"context_id": "<id>", "cluster_id": "<id>"}]}],
 "unassigned": [{"context_id": "<id>", "cluster_id": "<id>"}]}
"#;

#[derive(Debug, Clone, ThisError, PartialEq)]
pub enum NormalizationError {
    #[error("Cluster key {0} appears more than once in the input")]
    DuplicateInputKey(ClusterKey),

    #[error("Cluster key {key} assigned more than once")]
    DuplicateAssignment { key: ClusterKey },

    #[error("Cluster key {key} is not part of the input")]
    ForeignAssignment { key: ClusterKey },
}

impl From<NormalizationError> for Error {
    fn from(err: NormalizationError) -> Self {
        Error::Precondition(err.to_string())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NormalizationConfig {
    pub template: PromptTemplate,
    pub template_sha256: String,
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub batch_size: usize,
}

impl NormalizationConfig {
    pub fn from_section(section: &NormalizationSection, model: &str) -> Result<Self> {
        let template = PromptTemplate::load(
            section.template_path.as_deref(),
            DEFAULT_NORMALIZATION_TEMPLATE,
            NORMALIZATION_PLACEHOLDERS,
            REQUIRED_PLACEHOLDERS,
        )?;
        Self::new(template, model, section.max_output_tokens, section.batch_size)
    }

    pub fn new(template: PromptTemplate, model: &str, max_output_tokens: u32, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::Config("normalization.batch_size must be at least 1".to_string()));
        }
        if max_output_tokens == 0 {
            return Err(Error::Config("normalization.max_output_tokens must be at least 1".to_string()));
        }
        Ok(Self {
            template_sha256: template.hash(),
            template,
            model: model.to_string(),
            temperature: 0.0,
            max_output_tokens,
            batch_size,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Normalized,
    ServiceFailure,
    ParseError,
    SchemaError,
    Skipped,
}

impl BatchStatus {
    fn unassigned_reason(self) -> Option<UnassignedReason> {
        match self {
            BatchStatus::Normalized => None,
            BatchStatus::ServiceFailure => Some(UnassignedReason::BatchServiceFailure),
            BatchStatus::ParseError => Some(UnassignedReason::BatchParseError),
            BatchStatus::SchemaError => Some(UnassignedReason::BatchSchemaError),
            BatchStatus::Skipped => Some(UnassignedReason::BatchSkipped),
        }
    }

    fn parse_outcome(self, used_fallback: bool) -> Option<ParseOutcome> {
        match self {
            BatchStatus::Normalized => Some(ParseOutcome::from_phases(used_fallback, true)),
            BatchStatus::ParseError => Some(ParseOutcome::ParseError),
            BatchStatus::SchemaError => Some(ParseOutcome::SchemaError),
            BatchStatus::ServiceFailure | BatchStatus::Skipped => None,
        }
    }
}

/// Per-batch outcome row (`batches.jsonl`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_index: usize,
    pub status: BatchStatus,
    pub cluster_keys: Vec<ClusterKey>,
    pub group_count: usize,
    pub declined: usize,
    pub omitted: usize,
    /// Keys the response mentioned that belong to no cluster of this batch
    pub foreign_keys: Vec<ClusterKey>,
    pub violations: Vec<String>,
    pub used_fallback: bool,
    pub call_id: Option<String>,
    pub taxonomy_version: String,
}

#[derive(Debug, Clone)]
pub struct NormalizationOutcome {
    pub instances: Vec<GlobalIssueInstance>,
    pub unassigned: Vec<UnassignedCluster>,
    pub batches: Vec<BatchRecord>,
}

impl NormalizationOutcome {
    pub fn skipped_batches(&self) -> usize {
        self.batches.iter().filter(|b| b.status == BatchStatus::Skipped).count()
    }
}

struct BatchResult {
    record: BatchRecord,
    assignment: Option<BatchAssignment>,
}

async fn normalize_batch(
    config: &NormalizationConfig,
    invoker: &ServiceInvoker,
    sink: &dyn TraceSink,
    taxonomy: &Taxonomy,
    batch: &ClusterBatch<'_>,
) -> Result<BatchResult> {
    let keys = batch.keys();
    let key_set: BTreeSet<ClusterKey> = keys.iter().cloned().collect();
    let request = GenerationRequest {
        prompt: render_batch(&config.template, taxonomy, batch)?,
        max_output_tokens: config.max_output_tokens,
        temperature: config.temperature,
    };
    let trace = invoker.call(&format!("batch-{}", batch.index), &request).await;
    sink.record(&trace)?;

    let (status, assignment, violations, used_fallback) = match &trace.raw_response {
        None => (BatchStatus::ServiceFailure, None, Vec::new(), false),
        Some(raw) => match extract_object(raw) {
            None => (BatchStatus::ParseError, None, Vec::new(), false),
            Some(extracted) => match validate_batch(&key_set, &extracted.object) {
                Ok(assignment) => (BatchStatus::Normalized, Some(assignment), Vec::new(), extracted.used_fallback),
                Err(violations) => (BatchStatus::SchemaError, None, violations, extracted.used_fallback),
            },
        },
    };

    if let Some(outcome) = status.parse_outcome(used_fallback) {
        sink.record_parse(&ParseRecord::new(&trace, outcome))?;
    }

    if status != BatchStatus::Normalized {
        tracing::warn!(
            batch_index = batch.index,
            status = ?status,
            violations = violations.len(),
            "Normalization batch failed"
        );
    }

    let record = BatchRecord {
        batch_index: batch.index,
        status,
        group_count: assignment.as_ref().map_or(0, |a| a.groups.len()),
        declined: assignment.as_ref().map_or(0, |a| a.declined.len()),
        omitted: assignment.as_ref().map_or(0, |a| a.omitted.len()),
        foreign_keys: assignment
            .as_ref()
            .map(|a| a.foreign.iter().cloned().collect())
            .unwrap_or_default(),
        cluster_keys: keys,
        violations,
        used_fallback,
        call_id: Some(trace.call_id.clone()),
        taxonomy_version: taxonomy.version.clone(),
    };
    Ok(BatchResult { record, assignment })
}

fn skipped_batch(batch: &ClusterBatch<'_>, taxonomy: &Taxonomy) -> BatchResult {
    BatchResult {
        record: BatchRecord {
            batch_index: batch.index,
            status: BatchStatus::Skipped,
            cluster_keys: batch.keys(),
            group_count: 0,
            declined: 0,
            omitted: 0,
            foreign_keys: Vec::new(),
            violations: Vec::new(),
            used_fallback: false,
            call_id: None,
            taxonomy_version: taxonomy.version.clone(),
        },
        assignment: None,
    }
}

/// Normalize all context clusters against `taxonomy`
///
/// Batches not started when `cancel` fires are recorded as skipped and their
/// keys go to the unassigned set.
pub async fn normalize(
    config: &NormalizationConfig,
    invoker: &ServiceInvoker,
    sink: &dyn TraceSink,
    taxonomy: &Taxonomy,
    clusters: &[Cluster],
    concurrency: usize,
    cancel: &CancellationToken,
) -> Result<NormalizationOutcome> {
    let mut by_key: BTreeMap<ClusterKey, &Cluster> = BTreeMap::new();
    for cluster in clusters {
        if by_key.insert(cluster.key(), cluster).is_some() {
            return Err(NormalizationError::DuplicateInputKey(cluster.key()).into());
        }
    }

    let batches = partition(clusters, config.batch_size);
    tracing::info!(
        clusters = clusters.len(),
        batches = batches.len(),
        batch_size = config.batch_size,
        taxonomy_version = %taxonomy.version,
        "Starting normalization"
    );

    let results: Vec<Result<BatchResult>> = stream::iter(batches.iter())
        .map(|batch| async move {
            if cancel.is_cancelled() {
                return Ok(skipped_batch(batch, taxonomy));
            }
            normalize_batch(config, invoker, sink, taxonomy, batch).await
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut results = results.into_iter().collect::<Result<Vec<_>>>()?;
    results.sort_by_key(|r| r.record.batch_index);

    let mut groups = Vec::new();
    let mut unassigned = Vec::new();
    for result in &results {
        let index = result.record.batch_index;
        let version = &taxonomy.version;
        let unassigned_with = |key: &ClusterKey, reason| UnassignedCluster {
            key: key.clone(),
            reason,
            batch_index: Some(index),
            taxonomy_version: version.clone(),
        };
        match (&result.assignment, result.record.status.unassigned_reason()) {
            (Some(assignment), None) => {
                groups.extend(assignment.groups.iter().cloned().map(|g| (index, g)));
                unassigned.extend(
                    assignment
                        .declined
                        .iter()
                        .map(|k| unassigned_with(k, UnassignedReason::DeclinedByService)),
                );
                unassigned.extend(
                    assignment
                        .omitted
                        .iter()
                        .map(|k| unassigned_with(k, UnassignedReason::OmittedByService)),
                );
            }
            (_, reason) => {
                let reason = reason.unwrap_or(UnassignedReason::NotFoundInAnyGroup);
                unassigned.extend(result.record.cluster_keys.iter().map(|k| unassigned_with(k, reason)));
            }
        }
    }

    let instances = merge_groups(taxonomy, &groups, &by_key)?;
    let input: BTreeSet<ClusterKey> = by_key.keys().cloned().collect();
    let unassigned = enforce_coverage(&input, &instances, unassigned, &taxonomy.version)?;

    tracing::info!(
        instances = instances.len(),
        unassigned = unassigned.len(),
        "Normalization complete"
    );

    Ok(NormalizationOutcome {
        instances,
        unassigned,
        batches: results.into_iter().map(|r| r.record).collect(),
    })
}
