//! Classification engine
//!
//! `classify` renders one prompt, calls the service, hands the trace to the
//! sink, then parses and validates the response into a normalized
//! [`PredictionRecord`]. Failures are flags on the record, never errors;
//! the only `Err` is a failure to persist the trace.

pub mod config;

pub use config::{ClassificationConfig, ClassificationConfigError, DEFAULT_TEMPLATE};

use crate::parse::fields::{optional_string, required_number, required_string, truncate_chars, Object};
use crate::parse::{extract_object, ParseOutcome};
use crate::run::{ParseRecord, TraceSink};
use crate::service::{CallTrace, GenerationRequest, ServiceInvoker};
use critiq_common::schema::{Item, Label, PredictionFlags, PredictionRecord};
use critiq_common::Result;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

/// Validated classification response
#[derive(Debug, Clone, PartialEq)]
struct ClassificationOutput {
    label: Label,
    confidence: f64,
    rationale_summary: String,
    evidence_snippet: String,
}

/// Classify one item
pub async fn classify(
    config: &ClassificationConfig,
    invoker: &ServiceInvoker,
    sink: &dyn TraceSink,
    item: &Item,
) -> Result<(PredictionRecord, CallTrace)> {
    let request = GenerationRequest {
        prompt: config.render(item),
        max_output_tokens: config.max_output_tokens,
        temperature: config.temperature,
    };

    let trace = invoker.call(&item.item_id, &request).await;
    sink.record(&trace)?;

    let record = match &trace.raw_response {
        None => PredictionRecord::failed(
            item.item_id.as_str(),
            item.context_id.as_str(),
            PredictionFlags {
                service_failure: true,
                ..PredictionFlags::default()
            },
        ),
        Some(raw) => {
            let (record, outcome) = parse_prediction(item, raw, config.max_rationale_chars);
            sink.record_parse(&ParseRecord::new(&trace, outcome))?;
            record
        }
    };

    if record.has_error() {
        tracing::warn!(
            item_id = %item.item_id,
            context_id = %item.context_id,
            parse_error = record.parse_error,
            schema_error = record.schema_error,
            service_failure = record.service_failure,
            "Classification produced an error record"
        );
    }
    Ok((record, trace))
}

/// Both parsing phases for one raw response
pub fn parse_prediction(item: &Item, raw: &str, max_chars: usize) -> (PredictionRecord, ParseOutcome) {
    let Some(extracted) = extract_object(raw) else {
        let record = PredictionRecord::failed(
            item.item_id.as_str(),
            item.context_id.as_str(),
            PredictionFlags {
                parse_error: true,
                ..PredictionFlags::default()
            },
        );
        return (record, ParseOutcome::ParseError);
    };

    match validate_output(&extracted.object, max_chars) {
        Ok(output) => {
            let record = PredictionRecord::new(
                item.item_id.as_str(),
                item.context_id.as_str(),
                output.label,
                output.rationale_summary,
                output.evidence_snippet,
                output.confidence,
                PredictionFlags {
                    used_fallback: extracted.used_fallback,
                    ..PredictionFlags::default()
                },
            );
            (record, ParseOutcome::from_phases(extracted.used_fallback, true))
        }
        Err(violations) => {
            tracing::debug!(item_id = %item.item_id, ?violations, "Response failed validation");
            let record = PredictionRecord::failed(
                item.item_id.as_str(),
                item.context_id.as_str(),
                PredictionFlags {
                    schema_error: true,
                    used_fallback: extracted.used_fallback,
                    ..PredictionFlags::default()
                },
            );
            (record, ParseOutcome::SchemaError)
        }
    }
}

fn validate_output(obj: &Object, max_chars: usize) -> std::result::Result<ClassificationOutput, Vec<String>> {
    let label = required_string(obj, "label");
    let confidence = required_number(obj, "confidence");
    let rationale = optional_string(obj, "rationale_summary");
    let evidence = optional_string(obj, "evidence_snippet");

    match (label, confidence, rationale, evidence) {
        (Ok(label), Ok(confidence), Ok(rationale), Ok(evidence)) => Ok(ClassificationOutput {
            label: Label::normalize(label),
            confidence,
            rationale_summary: truncate_chars(rationale.unwrap_or(""), max_chars),
            evidence_snippet: truncate_chars(evidence.unwrap_or(""), max_chars),
        }),
        (label, confidence, rationale, evidence) => {
            let mut violations = Vec::new();
            if let Err(v) = label {
                violations.push(v);
            }
            if let Err(v) = confidence {
                violations.push(v);
            }
            if let Err(v) = rationale {
                violations.push(v);
            }
            if let Err(v) = evidence {
                violations.push(v);
            }
            Err(violations)
        }
    }
}

/// Predictions of a fan-out, in input order
#[derive(Debug, Clone, Default)]
pub struct ClassifyBatch {
    /// `None` for items skipped after cancellation
    pub predictions: Vec<Option<PredictionRecord>>,
}

impl ClassifyBatch {
    pub fn completed(&self) -> impl Iterator<Item = &PredictionRecord> {
        self.predictions.iter().flatten()
    }

    pub fn skipped(&self) -> usize {
        self.predictions.iter().filter(|p| p.is_none()).count()
    }
}

/// Classify `items` with up to `concurrency` calls in flight
///
/// Items not yet started when `cancel` fires are skipped.
pub async fn classify_items(
    config: &ClassificationConfig,
    invoker: &ServiceInvoker,
    sink: &dyn TraceSink,
    items: &[Item],
    concurrency: usize,
    cancel: &CancellationToken,
) -> Result<ClassifyBatch> {
    let total = items.len();
    let done = AtomicUsize::new(0);

    let results: Vec<Result<(usize, Option<PredictionRecord>)>> = stream::iter(items.iter().enumerate())
        .map(|(index, item)| {
            let done = &done;
            async move {
                if cancel.is_cancelled() {
                    return Ok((index, None));
                }
                let (record, _trace) = classify(config, invoker, sink, item).await?;

                let current = done.fetch_add(1, Ordering::Relaxed) + 1;
                if current % 50 == 0 || current == total {
                    tracing::info!(progress = format!("{}/{}", current, total), "Classification progress");
                }
                Ok((index, Some(record)))
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut predictions: Vec<Option<PredictionRecord>> = vec![None; total];
    for result in results {
        let (index, record) = result?;
        predictions[index] = record;
    }
    Ok(ClassifyBatch { predictions })
}
