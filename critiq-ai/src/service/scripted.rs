//! In-process generation service driven by a script
//!
//! Used by tests and for offline replays of a recorded `calls.jsonl`.

use super::trace::CallTrace;
use super::{GenerationRequest, GenerationResponse, GenerationService, ServiceError};
use critiq_common::hash::sha256_hex;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub type Reply = Result<GenerationResponse, ServiceError>;

type Responder = Box<dyn Fn(&GenerationRequest) -> Reply + Send + Sync>;

pub struct ScriptedService {
    name: String,
    responder: Responder,
    delay: Option<Duration>,
    calls: AtomicU64,
}

impl ScriptedService {
    /// Reply computed from each request
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&GenerationRequest) -> Reply + Send + Sync + 'static,
    {
        Self {
            name: "scripted".to_string(),
            responder: Box::new(responder),
            delay: None,
            calls: AtomicU64::new(0),
        }
    }

    /// Same text for every request
    pub fn always_text(text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(move |_| Ok(GenerationResponse::text(text.clone())))
    }

    /// Replies in order; requests past the end get an invalid-response error
    pub fn sequence(replies: Vec<Reply>) -> Self {
        let queue = Mutex::new(VecDeque::from(replies));
        Self::new(move |_| {
            let next = match queue.lock() {
                Ok(mut q) => q.pop_front(),
                Err(_) => None,
            };
            next.unwrap_or_else(|| {
                Err(ServiceError::InvalidResponse("script exhausted".to_string()))
            })
        })
    }

    /// Serve the raw responses recorded in a call log, matched by prompt hash
    ///
    /// Prompts with no recorded successful response fail with an
    /// invalid-response error.
    pub fn replay(calls_path: &Path) -> critiq_common::Result<Self> {
        let traces: Vec<CallTrace> = critiq_common::jsonl::read_rows(calls_path)?;
        let mut recorded: HashMap<String, String> = HashMap::new();
        for trace in traces {
            if let Some(raw) = trace.raw_response {
                recorded.entry(trace.prompt_sha256).or_insert(raw);
            }
        }
        tracing::info!(
            path = %calls_path.display(),
            responses = recorded.len(),
            "Loaded recorded responses for replay"
        );

        let mut service = Self::new(move |request| {
            let key = sha256_hex(request.prompt.as_bytes());
            recorded
                .get(&key)
                .map(|raw| GenerationResponse::text(raw.clone()))
                .ok_or_else(|| {
                    ServiceError::InvalidResponse(format!("no recorded response for prompt {}", key))
                })
        });
        service.name = "replay".to_string();
        Ok(service)
    }

    /// Sleep before every reply
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of requests received
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl GenerationService for ScriptedService {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, ServiceError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        (self.responder)(request)
    }
}
