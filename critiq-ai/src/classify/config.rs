//! Classification configuration
//!
//! Built once per stage invocation from `[classification]`, snapshotted into
//! the run manifest, and hashed; two runs share a configuration hash exactly
//! when they render identical prompts and score identically.

use crate::benchmark::MetricsPolicy;
use crate::prompt::{PromptTemplate, TemplateError};
use critiq_common::config::ClassificationSection;
use critiq_common::schema::Item;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Placeholders a classification template may use
pub const CLASSIFICATION_PLACEHOLDERS: &[&str] = &["text", "item_id", "context_id"];

pub const DEFAULT_TEMPLATE: &str = r#"You are reviewing a social media post about a university course.
Decide whether the post expresses a criticism of the course (positive),
clearly does not (negative), or cannot be judged (unknown).

Course: {{context_id}}
Post id: {{item_id}}
Post:
"""
{{text}}
"""

Reply with a single JSON object and nothing else:
{"label": "positive" | "negative" | "unknown",
 "confidence": <number between 0 and 1>,
 "rationale_summary": "<one sentence, only when positive>",
 "evidence_snippet": "<short quote from the post, only when positive>"}
"#;

#[derive(Debug, Error)]
pub enum ClassificationConfigError {
    #[error("Cannot read template {path}: {source}")]
    ReadTemplate {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid template: {0}")]
    Template(#[from] TemplateError),

    #[error("Unknown metrics policy '{0}' (expected exclude_unknown or unknown_as_negative)")]
    UnknownPolicy(String),

    #[error("Invalid classification setting: {0}")]
    InvalidSetting(String),
}

impl From<ClassificationConfigError> for critiq_common::Error {
    fn from(err: ClassificationConfigError) -> Self {
        critiq_common::Error::Config(err.to_string())
    }
}

/// Everything that determines how one item is classified and scored
#[derive(Debug, Clone, Serialize)]
pub struct ClassificationConfig {
    pub config_id: String,
    pub template: PromptTemplate,
    pub template_sha256: String,
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub max_rationale_chars: usize,
    pub metrics_policy: MetricsPolicy,
}

impl ClassificationConfig {
    /// Build from the TOML section; the built-in template is used when no
    /// path is configured
    pub fn from_section(
        section: &ClassificationSection,
        model: &str,
    ) -> Result<Self, ClassificationConfigError> {
        let source = match &section.template_path {
            Some(path) => std::fs::read_to_string(path).map_err(|source| {
                ClassificationConfigError::ReadTemplate {
                    path: path.clone(),
                    source,
                }
            })?,
            None => DEFAULT_TEMPLATE.to_string(),
        };
        let metrics_policy = MetricsPolicy::parse(&section.metrics_policy)
            .ok_or_else(|| ClassificationConfigError::UnknownPolicy(section.metrics_policy.clone()))?;
        Self::new(
            &section.config_id,
            &source,
            model,
            section.temperature,
            section.max_output_tokens,
            section.max_rationale_chars,
            metrics_policy,
        )
    }

    pub fn new(
        config_id: &str,
        template_source: &str,
        model: &str,
        temperature: f32,
        max_output_tokens: u32,
        max_rationale_chars: usize,
        metrics_policy: MetricsPolicy,
    ) -> Result<Self, ClassificationConfigError> {
        if config_id.trim().is_empty() {
            return Err(ClassificationConfigError::InvalidSetting(
                "config_id must not be empty".to_string(),
            ));
        }
        if !temperature.is_finite() || temperature < 0.0 {
            return Err(ClassificationConfigError::InvalidSetting(format!(
                "temperature must be a non-negative number, got {}",
                temperature
            )));
        }
        if max_output_tokens == 0 {
            return Err(ClassificationConfigError::InvalidSetting(
                "max_output_tokens must be at least 1".to_string(),
            ));
        }

        let template = PromptTemplate::parse(template_source, CLASSIFICATION_PLACEHOLDERS, &["text"])?;
        Ok(Self {
            config_id: config_id.to_string(),
            template_sha256: template.hash(),
            template,
            model: model.to_string(),
            temperature,
            max_output_tokens,
            max_rationale_chars,
            metrics_policy,
        })
    }

    /// Deterministic prompt for one item
    pub fn render(&self, item: &Item) -> String {
        self.template.render(|name| match name {
            "text" => item.text.as_str(),
            "item_id" => item.item_id.as_str(),
            "context_id" => item.context_id.as_str(),
            _ => "",
        })
    }
}
