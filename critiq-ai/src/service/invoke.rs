//! Retry state machine around a single service call
//!
//! ```text
//! Attempt(n) ──ok──────────────▶ Success
//!     │
//!     ├─retryable, n ≤ max_retries ─▶ RetryableFailure ─▶ Backoff ─▶ Attempt(n+1)
//!     │
//!     └─otherwise ─────────────────▶ TerminalFailure
//! ```
//!
//! Every edge is appended to the call's [`CallTrace`]; nothing is only
//! visible in a log line.

use super::trace::{AttemptRecord, CallState, CallTrace, Transition};
use super::{CostModel, GenerationRequest, GenerationService, ServiceError, UsageLedger};
use critiq_common::config::ServiceConfig;
use critiq_common::hash::sha256_hex;
use critiq_common::schema::token_count;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Share of the nominal backoff added as random jitter, at most
const JITTER_FRACTION: f64 = 0.2;

/// Bounded retry configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub attempt_timeout_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
            attempt_timeout_ms: config.timeout_secs.saturating_mul(1000),
        }
    }

    /// Nominal delay before retry number `retry` (1-based), before jitter
    pub fn nominal_backoff_ms(&self, retry: u32) -> u64 {
        let shift = retry.saturating_sub(1).min(32);
        self.initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms)
    }

    /// Nominal delay plus up to 20% jitter, never above `max_backoff_ms`
    fn backoff_ms(&self, retry: u32) -> u64 {
        let nominal = self.nominal_backoff_ms(retry);
        let max_jitter = (nominal as f64 * JITTER_FRACTION) as u64;
        let jitter = if max_jitter == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=max_jitter)
        };
        nominal.saturating_add(jitter).min(self.max_backoff_ms)
    }
}

/// Shared call machinery for one stage: service, retry policy, accounting
#[derive(Clone)]
pub struct ServiceInvoker {
    service: Arc<dyn GenerationService>,
    policy: RetryPolicy,
    cost: CostModel,
    ledger: Arc<UsageLedger>,
}

impl ServiceInvoker {
    pub fn new(service: Arc<dyn GenerationService>, policy: RetryPolicy, cost: CostModel) -> Self {
        Self {
            service,
            policy,
            cost,
            ledger: Arc::new(UsageLedger::new()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    /// Run one call to completion; never fails, the outcome is in the trace
    pub async fn call(&self, unit_key: &str, request: &GenerationRequest) -> CallTrace {
        let call_id = Uuid::new_v4().simple().to_string();
        let started_at = critiq_common::time::now();
        let start = Instant::now();
        let attempt_timeout = Duration::from_millis(self.policy.attempt_timeout_ms.max(1));

        let mut attempts = Vec::new();
        let mut transitions = Vec::new();
        let mut attempt: u32 = 1;

        let (outcome, final_state) = loop {
            transitions.push(Transition::Attempt { attempt });
            let attempt_started = critiq_common::time::now();
            let attempt_start = Instant::now();

            let result = match tokio::time::timeout(attempt_timeout, self.service.generate(request)).await {
                Ok(result) => result,
                Err(_) => Err(ServiceError::Timeout(self.policy.attempt_timeout_ms)),
            };

            attempts.push(AttemptRecord {
                attempt,
                started_at: attempt_started,
                latency_ms: attempt_start.elapsed().as_millis() as u64,
                error: result.as_ref().err().cloned(),
            });

            match result {
                Ok(response) => {
                    transitions.push(Transition::Success { attempt });
                    break (Ok(response), CallState::Success);
                }
                Err(error) if error.is_retryable() && attempt <= self.policy.max_retries => {
                    tracing::warn!(
                        unit = unit_key,
                        attempt,
                        service = self.service.name(),
                        error = %error,
                        "Service call failed, will retry"
                    );
                    transitions.push(Transition::RetryableFailure {
                        attempt,
                        error: error.clone(),
                    });
                    let delay_ms = self.policy.backoff_ms(attempt);
                    transitions.push(Transition::Backoff { attempt, delay_ms });
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
                Err(error) => {
                    tracing::error!(
                        unit = unit_key,
                        attempt,
                        service = self.service.name(),
                        error = %error,
                        "Service call failed permanently"
                    );
                    transitions.push(Transition::TerminalFailure {
                        attempt,
                        error: error.clone(),
                    });
                    break (Err(error), CallState::TerminalFailure);
                }
            }
        };

        let (raw_response, error, input_tokens, output_tokens, tokens_estimated) = match outcome {
            Ok(response) => {
                let estimated = response.input_tokens.is_none() || response.output_tokens.is_none();
                let input = response
                    .input_tokens
                    .unwrap_or_else(|| token_count(&request.prompt) as u64);
                let output = response
                    .output_tokens
                    .unwrap_or_else(|| token_count(&response.text) as u64);
                (Some(response.text), None, input, output, estimated)
            }
            Err(error) => (None, Some(error), 0, 0, false),
        };

        let trace = CallTrace {
            call_id,
            unit_key: unit_key.to_string(),
            prompt: request.prompt.clone(),
            prompt_sha256: sha256_hex(request.prompt.as_bytes()),
            raw_response,
            attempts,
            transitions,
            final_state,
            error,
            input_tokens,
            output_tokens,
            tokens_estimated,
            latency_ms: start.elapsed().as_millis() as u64,
            cost_usd: self.cost.cost_usd(input_tokens, output_tokens),
            started_at,
        };

        self.ledger.record(&trace);
        tracing::debug!(
            unit = unit_key,
            call_id = %trace.call_id,
            attempts = trace.attempts.len(),
            latency_ms = trace.latency_ms,
            "Service call finished"
        );
        trace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{GenerationResponse, ScriptedService};

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            attempt_timeout_ms: 50,
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            prompt: "classify this".into(),
            max_output_tokens: 10,
            temperature: 0.0,
        }
    }

    #[test]
    fn test_nominal_backoff_doubles_and_caps() {
        let p = RetryPolicy {
            max_retries: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
            attempt_timeout_ms: 1000,
        };
        assert_eq!(p.nominal_backoff_ms(1), 100);
        assert_eq!(p.nominal_backoff_ms(2), 200);
        assert_eq!(p.nominal_backoff_ms(3), 400);
        assert_eq!(p.nominal_backoff_ms(4), 500);
        for retry in 1..6 {
            assert!(p.backoff_ms(retry) <= 500);
        }
    }

    #[tokio::test]
    async fn test_success_after_retryable_failure() {
        let service = ScriptedService::sequence(vec![
            Err(ServiceError::Api(503, "busy".into())),
            Ok(GenerationResponse::text("{}")),
        ]);
        let invoker = ServiceInvoker::new(Arc::new(service), policy(2), CostModel::default());

        let trace = invoker.call("item-1", &request()).await;
        assert!(trace.succeeded());
        assert_eq!(trace.attempts.len(), 2);
        assert_eq!(trace.raw_response.as_deref(), Some("{}"));
        assert!(trace.tokens_estimated);
        assert!(matches!(trace.transitions[1], Transition::RetryableFailure { attempt: 1, .. }));
        assert!(matches!(trace.transitions[2], Transition::Backoff { attempt: 1, .. }));
        assert!(matches!(trace.transitions.last(), Some(Transition::Success { attempt: 2 })));
        assert_eq!(invoker.ledger().summary().retries, 1);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let service = ScriptedService::sequence(vec![Err(ServiceError::Auth)]);
        let invoker = ServiceInvoker::new(Arc::new(service), policy(3), CostModel::default());

        let trace = invoker.call("item-1", &request()).await;
        assert_eq!(trace.final_state, CallState::TerminalFailure);
        assert_eq!(trace.attempts.len(), 1);
        assert_eq!(trace.error, Some(ServiceError::Auth));
        assert_eq!(invoker.ledger().summary().failed_calls, 1);
    }

    #[tokio::test]
    async fn test_timeouts_exhaust_retries() {
        let service = ScriptedService::always_text("{}").with_delay(Duration::from_millis(500));
        let invoker = ServiceInvoker::new(Arc::new(service), policy(2), CostModel::default());

        let trace = invoker.call("item-1", &request()).await;
        assert_eq!(trace.final_state, CallState::TerminalFailure);
        assert_eq!(trace.attempts.len(), 3);
        assert_eq!(trace.error, Some(ServiceError::Timeout(50)));
        assert!(trace.raw_response.is_none());
    }

    #[tokio::test]
    async fn test_reported_tokens_used_for_cost() {
        let service = ScriptedService::sequence(vec![Ok(GenerationResponse {
            text: "{}".into(),
            input_tokens: Some(1000),
            output_tokens: Some(500),
        })]);
        let cost = CostModel {
            input_per_1k: 1.0,
            output_per_1k: 2.0,
        };
        let invoker = ServiceInvoker::new(Arc::new(service), policy(0), cost);

        let trace = invoker.call("u", &request()).await;
        assert!(!trace.tokens_estimated);
        assert_eq!(trace.input_tokens, 1000);
        assert!((trace.cost_usd - 2.0).abs() < 1e-12);
    }
}
