//! Configuration loading and root folder resolution
//!
//! One TOML file configures every stage. It is loaded once per stage
//! invocation and threaded explicitly through every call; each stage copies
//! the parts it uses into its manifest.
//!
//! # Settings Sources Priority
//!
//! Root folder:
//! 1. Command-line argument (`--root`)
//! 2. Environment variable (`CRITIQ_ROOT_FOLDER`)
//! 3. TOML `root_folder`
//!
//! There is no OS-dependent fallback: an unresolved root folder is an error,
//! so the same command never writes to different places on different hosts.
//!
//! API key:
//! 1. Environment variable named by `service.api_key_env`
//! 2. TOML `service.api_key`

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Environment variable overriding the TOML root folder
pub const ROOT_FOLDER_ENV: &str = "CRITIQ_ROOT_FOLDER";

/// Top-level TOML configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CritiqConfig {
    /// Directory holding `runs/` and `registry.db`
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    #[serde(default)]
    pub logging: LoggingConfig,

    pub service: ServiceConfig,

    #[serde(default)]
    pub classification: ClassificationSection,

    #[serde(default)]
    pub sampler: SamplerSection,

    #[serde(default)]
    pub gate: GateSection,

    #[serde(default)]
    pub clustering: ClusteringSection,

    #[serde(default)]
    pub normalization: NormalizationSection,

    #[serde(default)]
    pub stage: StageSection,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` overrides
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// External generation service connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Base URL of an OpenAI-compatible API, e.g. `https://api.openai.com/v1`
    pub base_url: String,

    pub model: String,

    /// Name of the environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// API key fallback when the environment variable is unset
    #[serde(default)]
    pub api_key: Option<String>,

    /// Per-attempt timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Maximum concurrent calls within a stage
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,

    #[serde(default)]
    pub input_cost_per_1k_tokens: f64,

    #[serde(default)]
    pub output_cost_per_1k_tokens: f64,
}

fn default_api_key_env() -> String {
    "CRITIQ_API_KEY".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    8_000
}
fn default_concurrency() -> usize {
    4
}
fn default_requests_per_second() -> u32 {
    2
}

/// `[classification]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationSection {
    /// Human-readable identifier of this classification procedure
    #[serde(default = "default_config_id")]
    pub config_id: String,

    /// Prompt template path; the built-in template is used when absent
    #[serde(default)]
    pub template_path: Option<PathBuf>,

    #[serde(default)]
    pub temperature: f32,

    #[serde(default = "default_classification_max_tokens")]
    pub max_output_tokens: u32,

    /// Truncation limit for rationale and evidence text
    #[serde(default = "default_max_rationale_chars")]
    pub max_rationale_chars: usize,

    /// `exclude_unknown` or `unknown_as_negative`
    #[serde(default = "default_metrics_policy")]
    pub metrics_policy: String,
}

impl Default for ClassificationSection {
    fn default() -> Self {
        Self {
            config_id: default_config_id(),
            template_path: None,
            temperature: 0.0,
            max_output_tokens: default_classification_max_tokens(),
            max_rationale_chars: default_max_rationale_chars(),
            metrics_policy: default_metrics_policy(),
        }
    }
}

fn default_config_id() -> String {
    "builtin-v1".to_string()
}
fn default_classification_max_tokens() -> u32 {
    400
}
fn default_max_rationale_chars() -> usize {
    400
}
fn default_metrics_policy() -> String {
    "exclude_unknown".to_string()
}

/// `[sampler]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerSection {
    /// Token-count upper bounds (exclusive) of each length bucket but the last
    #[serde(default = "default_length_boundaries")]
    pub length_boundaries: Vec<usize>,

    /// Fraction of each bucket assigned to split A
    #[serde(default = "default_split_ratio")]
    pub split_ratio: f64,
}

impl Default for SamplerSection {
    fn default() -> Self {
        Self {
            length_boundaries: default_length_boundaries(),
            split_ratio: default_split_ratio(),
        }
    }
}

fn default_length_boundaries() -> Vec<usize> {
    vec![16, 48]
}
fn default_split_ratio() -> f64 {
    0.5
}

/// `[gate]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSection {
    /// Significance threshold for the paired test
    #[serde(default = "default_alpha")]
    pub alpha: f64,
}

impl Default for GateSection {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
        }
    }
}

fn default_alpha() -> f64 {
    0.05
}

/// `[clustering]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusteringSection {
    #[serde(default)]
    pub template_path: Option<PathBuf>,

    #[serde(default = "default_batch_max_tokens")]
    pub max_output_tokens: u32,
}

impl Default for ClusteringSection {
    fn default() -> Self {
        Self {
            template_path: None,
            max_output_tokens: default_batch_max_tokens(),
        }
    }
}

fn default_batch_max_tokens() -> u32 {
    4_000
}

/// `[normalization]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationSection {
    #[serde(default)]
    pub template_path: Option<PathBuf>,

    /// Taxonomy file; may also be given on the command line
    #[serde(default)]
    pub taxonomy_path: Option<PathBuf>,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_batch_max_tokens")]
    pub max_output_tokens: u32,
}

impl Default for NormalizationSection {
    fn default() -> Self {
        Self {
            template_path: None,
            taxonomy_path: None,
            batch_size: default_batch_size(),
            max_output_tokens: default_batch_max_tokens(),
        }
    }
}

fn default_batch_size() -> usize {
    40
}

/// `[stage]` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageSection {
    /// Wall-clock limit for a stage's work list; 0 disables the limit
    #[serde(default)]
    pub timeout_secs: u64,
}

impl CritiqConfig {
    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.service.base_url.trim().is_empty() {
            return Err(Error::Config("service.base_url must not be empty".to_string()));
        }
        if self.service.model.trim().is_empty() {
            return Err(Error::Config("service.model must not be empty".to_string()));
        }
        if self.service.concurrency == 0 {
            return Err(Error::Config("service.concurrency must be at least 1".to_string()));
        }
        if self.service.requests_per_second == 0 {
            return Err(Error::Config(
                "service.requests_per_second must be at least 1".to_string(),
            ));
        }
        if self.service.timeout_secs == 0 {
            return Err(Error::Config("service.timeout_secs must be at least 1".to_string()));
        }
        if self.service.max_retries > 10 {
            return Err(Error::Config("service.max_retries must be at most 10".to_string()));
        }
        if !(self.sampler.split_ratio > 0.0 && self.sampler.split_ratio < 1.0) {
            return Err(Error::Config(format!(
                "sampler.split_ratio must be in (0, 1), got {}",
                self.sampler.split_ratio
            )));
        }
        if self.sampler.length_boundaries.windows(2).any(|w| w[0] >= w[1]) {
            return Err(Error::Config(
                "sampler.length_boundaries must be strictly increasing".to_string(),
            ));
        }
        if !(self.gate.alpha > 0.0 && self.gate.alpha < 1.0) {
            return Err(Error::Config(format!(
                "gate.alpha must be in (0, 1), got {}",
                self.gate.alpha
            )));
        }
        if self.normalization.batch_size == 0 {
            return Err(Error::Config("normalization.batch_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Load and validate a TOML configuration file
pub fn load_toml_config(path: &Path) -> Result<CritiqConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Read TOML failed ({}): {}", path.display(), e))
    })?;
    let config: CritiqConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse TOML failed ({}): {}", path.display(), e)))?;
    config.validate()?;
    Ok(config)
}

/// Write a configuration file atomically (temp file + rename)
pub fn write_toml_config(config: &CritiqConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("toml.tmp");
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)?;
    Ok(())
}

/// Resolve the root folder (CLI → ENV → TOML)
pub fn resolve_root_folder(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    config: &CritiqConfig,
) -> Result<PathBuf> {
    if let Some(path) = cli_arg {
        return Ok(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }

    if let Some(path) = &config.root_folder {
        return Ok(path.clone());
    }

    Err(Error::Config(format!(
        "Root folder not configured. Use one of:\n\
         1. Command line: --root <dir>\n\
         2. Environment: {}=<dir>\n\
         3. TOML config: root_folder = \"<dir>\"",
        env_var_name
    )))
}

/// Resolve the service API key (ENV → TOML)
///
/// Returns `None` when neither source holds a valid key; local services
/// often need none.
pub fn resolve_api_key(service: &ServiceConfig) -> Option<String> {
    let env_key = std::env::var(&service.api_key_env)
        .ok()
        .filter(|k| is_valid_key(k));
    let toml_key = service.api_key.clone().filter(|k| is_valid_key(k));

    if env_key.is_some() && toml_key.is_some() {
        warn!(
            "API key found in both {} and TOML config. Using environment (highest priority).",
            service.api_key_env
        );
    }

    if let Some(key) = env_key {
        info!("API key loaded from environment variable {}", service.api_key_env);
        return Some(key);
    }
    if let Some(key) = toml_key {
        info!("API key loaded from TOML config");
        return Some(key);
    }
    None
}

/// Validate API key (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}
