//! Per-call audit record

use super::ServiceError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal state of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Success,
    TerminalFailure,
}

/// One edge of the retry state machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "to", rename_all = "snake_case")]
pub enum Transition {
    Attempt { attempt: u32 },
    Success { attempt: u32 },
    RetryableFailure { attempt: u32, error: ServiceError },
    Backoff { attempt: u32, delay_ms: u64 },
    TerminalFailure { attempt: u32, error: ServiceError },
}

/// One attempt of a call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub latency_ms: u64,
    pub error: Option<ServiceError>,
}

/// Everything needed to audit or replay one external call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallTrace {
    pub call_id: String,
    /// Work unit identity: item id, context id, or batch index
    pub unit_key: String,
    pub prompt: String,
    pub prompt_sha256: String,
    pub raw_response: Option<String>,
    pub attempts: Vec<AttemptRecord>,
    pub transitions: Vec<Transition>,
    pub final_state: CallState,
    pub error: Option<ServiceError>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Token counts came from the whitespace tokenizer
    pub tokens_estimated: bool,
    pub latency_ms: u64,
    pub cost_usd: f64,
    pub started_at: DateTime<Utc>,
}

impl CallTrace {
    pub fn succeeded(&self) -> bool {
        self.final_state == CallState::Success
    }

    pub fn retries(&self) -> u32 {
        self.attempts.len().saturating_sub(1) as u32
    }
}
