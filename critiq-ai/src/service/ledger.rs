//! Stage-wide cost and usage accounting
//!
//! Shared by every concurrent call of a stage; all updates are atomic
//! increments.

use super::CallTrace;
use critiq_common::manifest::UsageSummary;
use critiq_common::config::ServiceConfig;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-token pricing
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CostModel {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl CostModel {
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            input_per_1k: config.input_cost_per_1k_tokens,
            output_per_1k: config.output_cost_per_1k_tokens,
        }
    }

    pub fn cost_usd(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_per_1k
            + (output_tokens as f64 / 1000.0) * self.output_per_1k
    }
}

/// Atomic usage counters
#[derive(Debug, Default)]
pub struct UsageLedger {
    calls: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    failed_calls: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
    estimated_token_calls: AtomicU64,
    total_latency_ms: AtomicU64,
    cost_micro_usd: AtomicU64,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one finished call
    pub fn record(&self, trace: &CallTrace) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.attempts
            .fetch_add(trace.attempts.len() as u64, Ordering::Relaxed);
        self.retries
            .fetch_add(u64::from(trace.retries()), Ordering::Relaxed);
        if !trace.succeeded() {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }
        self.input_tokens
            .fetch_add(trace.input_tokens, Ordering::Relaxed);
        self.output_tokens
            .fetch_add(trace.output_tokens, Ordering::Relaxed);
        if trace.tokens_estimated {
            self.estimated_token_calls.fetch_add(1, Ordering::Relaxed);
        }
        self.total_latency_ms
            .fetch_add(trace.latency_ms, Ordering::Relaxed);
        let micro = (trace.cost_usd * 1_000_000.0).round();
        if micro.is_finite() && micro > 0.0 {
            self.cost_micro_usd.fetch_add(micro as u64, Ordering::Relaxed);
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Snapshot for the run manifest
    pub fn summary(&self) -> UsageSummary {
        let calls = self.calls.load(Ordering::Relaxed);
        let total_latency_ms = self.total_latency_ms.load(Ordering::Relaxed);
        let mean_latency_ms = if calls == 0 {
            0.0
        } else {
            total_latency_ms as f64 / calls as f64
        };
        UsageSummary {
            calls,
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
            estimated_token_calls: self.estimated_token_calls.load(Ordering::Relaxed),
            total_latency_ms,
            mean_latency_ms,
            cost_usd: self.cost_micro_usd.load(Ordering::Relaxed) as f64 / 1_000_000.0,
        }
    }
}
