//! External generation service
//!
//! Every classification, clustering and normalization call goes through the
//! [`GenerationService`] trait. The HTTP implementation talks to an
//! OpenAI-compatible endpoint; the scripted implementation serves tests and
//! offline replays of recorded call logs.

pub mod http_client;
pub mod invoke;
pub mod ledger;
pub mod scripted;
pub mod trace;

pub use http_client::HttpGenerationService;
pub use invoke::{RetryPolicy, ServiceInvoker};
pub use ledger::{CostModel, UsageLedger};
pub use scripted::ScriptedService;
pub use trace::{AttemptRecord, CallState, CallTrace, Transition};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One prompt sent to the service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
}

/// Raw service reply
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResponse {
    pub text: String,
    /// Token counts as reported by the service, if any
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

impl GenerationResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            input_tokens: None,
            output_tokens: None,
        }
    }
}

/// Service call errors
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ServiceError {
    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited by service")]
    RateLimited,

    #[error("API error {0}: {1}")]
    Api(u16, String),

    #[error("Authentication rejected by service")]
    Auth,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl ServiceError {
    /// Timeouts, network failures, rate limiting and 5xx responses are retried
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Timeout(_) | ServiceError::Network(_) | ServiceError::RateLimited => true,
            ServiceError::Api(code, _) => *code >= 500,
            ServiceError::Auth | ServiceError::InvalidResponse(_) => false,
        }
    }
}

/// Text-generation backend
#[async_trait::async_trait]
pub trait GenerationService: Send + Sync {
    /// Short identifier recorded in logs
    fn name(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, ServiceError>;
}
