//! Context-level clustering
//!
//! One call per context, carrying every accepted prediction of that context.
//! The response is validated as a whole: a single violation turns the
//! context into a `schema_error` with no clusters.

pub mod validate;

pub use validate::validate_clusters;

use crate::parse::{extract_object, ParseOutcome};
use crate::prompt::PromptTemplate;
use crate::run::{ParseRecord, TraceSink};
use crate::service::{GenerationRequest, ServiceInvoker};
use critiq_common::config::ClusteringSection;
use critiq_common::schema::{Cluster, PredictionRecord};
use critiq_common::{Error, Result};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tokio_util::sync::CancellationToken;

pub const CLUSTERING_PLACEHOLDERS: &[&str] = &["context_id", "items"];

pub const DEFAULT_CLUSTER_TEMPLATE: &str = r#"Below are criticisms of course {{context_id}}, one JSON object per post.
Group posts that raise the same underlying issue. A post may belong to
several groups. Leave out posts that fit no group.

Posts:
{{items}}

Reply with a single JSON object and nothing else:
{"clusters": [{"cluster_id": "{{context_id}}-<n>",
               "summary": "<one sentence describing the issue>",
               "member_item_ids": ["<item_id>", ...],
               "member_count": <number of distinct members>}],
 "unique_member_count": <number of distinct posts in at least one cluster>}
"#;

/// Snapshot of everything that shapes a clustering call
#[derive(Debug, Clone, Serialize)]
pub struct ClusteringConfig {
    pub template: PromptTemplate,
    pub template_sha256: String,
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl ClusteringConfig {
    pub fn from_section(section: &ClusteringSection, model: &str) -> Result<Self> {
        let template = PromptTemplate::load(
            section.template_path.as_deref(),
            DEFAULT_CLUSTER_TEMPLATE,
            CLUSTERING_PLACEHOLDERS,
            CLUSTERING_PLACEHOLDERS,
        )?;
        Self::new(template, model, section.max_output_tokens)
    }

    pub fn new(template: PromptTemplate, model: &str, max_output_tokens: u32) -> Result<Self> {
        if max_output_tokens == 0 {
            return Err(Error::Config("clustering.max_output_tokens must be at least 1".to_string()));
        }
        Ok(Self {
            template_sha256: template.hash(),
            template,
            model: model.to_string(),
            temperature: 0.0,
            max_output_tokens,
        })
    }

    /// Deterministic prompt; items are listed in `item_id` order
    pub fn render(&self, context_id: &str, accepted: &[&PredictionRecord]) -> Result<String> {
        let mut sorted: Vec<&&PredictionRecord> = accepted.iter().collect();
        sorted.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        let lines = sorted
            .iter()
            .map(|p| {
                serde_json::to_string(&PromptItem {
                    item_id: &p.item_id,
                    rationale: &p.rationale_summary,
                    evidence: &p.evidence_snippet,
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?
            .join("\n");

        Ok(self.template.render(|name| match name {
            "context_id" => context_id,
            "items" => lines.as_str(),
            _ => "",
        }))
    }
}

#[derive(Serialize)]
struct PromptItem<'a> {
    item_id: &'a str,
    rationale: &'a str,
    evidence: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    Clustered,
    ServiceFailure,
    ParseError,
    SchemaError,
    /// The stage deadline passed before the context was sent
    Skipped,
}

impl ContextStatus {
    /// `None` when no response reached the parser
    fn parse_outcome(self, used_fallback: bool) -> Option<ParseOutcome> {
        match self {
            ContextStatus::Clustered => Some(ParseOutcome::from_phases(used_fallback, true)),
            ContextStatus::ParseError => Some(ParseOutcome::ParseError),
            ContextStatus::SchemaError => Some(ParseOutcome::SchemaError),
            ContextStatus::ServiceFailure | ContextStatus::Skipped => None,
        }
    }
}

/// Per-context outcome row (`contexts.jsonl`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRecord {
    pub context_id: String,
    pub status: ContextStatus,
    pub accepted_items: usize,
    pub cluster_count: usize,
    /// Accepted items in no cluster; every accepted item when the call failed
    pub unclustered_item_ids: Vec<String>,
    pub violations: Vec<String>,
    pub used_fallback: bool,
    pub call_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ContextClustering {
    pub clusters: Vec<Cluster>,
    pub record: ContextRecord,
}

/// Cluster the accepted predictions of one context
///
/// Only accepted predictions (`positive`, no error flags) are sent; others
/// in `predictions` are ignored.
pub async fn cluster_context(
    config: &ClusteringConfig,
    invoker: &ServiceInvoker,
    sink: &dyn TraceSink,
    context_id: &str,
    predictions: &[PredictionRecord],
) -> Result<ContextClustering> {
    let accepted: Vec<&PredictionRecord> = predictions
        .iter()
        .filter(|p| p.is_accepted() && p.context_id == context_id)
        .collect();
    let input: BTreeSet<String> = accepted.iter().map(|p| p.item_id.clone()).collect();

    let request = GenerationRequest {
        prompt: config.render(context_id, &accepted)?,
        max_output_tokens: config.max_output_tokens,
        temperature: config.temperature,
    };
    let trace = invoker.call(context_id, &request).await;
    sink.record(&trace)?;

    let (status, clusters, violations, used_fallback) = match &trace.raw_response {
        None => (ContextStatus::ServiceFailure, Vec::new(), Vec::new(), false),
        Some(raw) => match extract_object(raw) {
            None => (ContextStatus::ParseError, Vec::new(), Vec::new(), false),
            Some(extracted) => match validate_clusters(context_id, &input, &extracted.object) {
                Ok(mut clusters) => {
                    clusters.sort_by(|a, b| a.cluster_id.cmp(&b.cluster_id));
                    (ContextStatus::Clustered, clusters, Vec::new(), extracted.used_fallback)
                }
                Err(violations) => (ContextStatus::SchemaError, Vec::new(), violations, extracted.used_fallback),
            },
        },
    };

    if let Some(outcome) = status.parse_outcome(used_fallback) {
        sink.record_parse(&ParseRecord::new(&trace, outcome))?;
    }

    let clustered: BTreeSet<&String> = clusters.iter().flat_map(|c| c.member_item_ids.iter()).collect();
    let unclustered_item_ids: Vec<String> = input.iter().filter(|id| !clustered.contains(id)).cloned().collect();

    match status {
        ContextStatus::Clustered if !unclustered_item_ids.is_empty() => tracing::info!(
            context_id,
            unclustered = unclustered_item_ids.len(),
            "Accepted items left out of every cluster"
        ),
        ContextStatus::Clustered => {}
        _ => tracing::warn!(
            context_id,
            status = ?status,
            violations = violations.len(),
            "Clustering failed for context"
        ),
    }

    let record = ContextRecord {
        context_id: context_id.to_string(),
        status,
        accepted_items: input.len(),
        cluster_count: clusters.len(),
        unclustered_item_ids,
        violations,
        used_fallback,
        call_id: Some(trace.call_id.clone()),
    };
    Ok(ContextClustering { clusters, record })
}

/// Accepted predictions grouped by context, contexts in id order
pub fn accepted_by_context(predictions: &[PredictionRecord]) -> BTreeMap<String, Vec<PredictionRecord>> {
    let mut grouped: BTreeMap<String, Vec<PredictionRecord>> = BTreeMap::new();
    for prediction in predictions.iter().filter(|p| p.is_accepted()) {
        grouped
            .entry(prediction.context_id.clone())
            .or_default()
            .push(prediction.clone());
    }
    grouped
}

fn skipped_context(context_id: &str, accepted: &[PredictionRecord]) -> ContextClustering {
    let unclustered: BTreeSet<String> = accepted.iter().map(|p| p.item_id.clone()).collect();
    ContextClustering {
        clusters: Vec::new(),
        record: ContextRecord {
            context_id: context_id.to_string(),
            status: ContextStatus::Skipped,
            accepted_items: unclustered.len(),
            cluster_count: 0,
            unclustered_item_ids: unclustered.into_iter().collect(),
            violations: Vec::new(),
            used_fallback: false,
            call_id: None,
        },
    }
}

/// Cluster every context with accepted predictions, `concurrency` calls in flight
///
/// Results are in context id order. Contexts not started when `cancel`
/// fires are recorded as skipped.
pub async fn cluster_contexts(
    config: &ClusteringConfig,
    invoker: &ServiceInvoker,
    sink: &dyn TraceSink,
    predictions: &[PredictionRecord],
    concurrency: usize,
    cancel: &CancellationToken,
) -> Result<Vec<ContextClustering>> {
    let grouped = accepted_by_context(predictions);
    let total = grouped.len();

    let results: Vec<Result<(usize, ContextClustering)>> = stream::iter(grouped.iter().enumerate())
        .map(|(index, (context_id, accepted))| async move {
            if cancel.is_cancelled() {
                return Ok((index, skipped_context(context_id, accepted)));
            }
            let outcome = cluster_context(config, invoker, sink, context_id, accepted).await?;
            tracing::debug!(index, total, context_id = %context_id, "Context clustered");
            Ok((index, outcome))
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut indexed = results.into_iter().collect::<Result<Vec<_>>>()?;
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, outcome)| outcome).collect())
}
