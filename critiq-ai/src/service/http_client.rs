//! OpenAI-compatible chat completions client
//!
//! Rate limited with a direct governor limiter (requests per second from
//! `[service]`). Retries are not handled here; see [`super::invoke`].

use super::{GenerationRequest, GenerationResponse, GenerationService, ServiceError};
use critiq_common::config::ServiceConfig;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::time::Duration;

const USER_AGENT: &str = concat!("critiq/", env!("CARGO_PKG_VERSION"));

type DirectLimiter = governor::RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

/// HTTP generation service
pub struct HttpGenerationService {
    http_client: reqwest::Client,
    rate_limiter: DirectLimiter,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    timeout_ms: u64,
}

impl HttpGenerationService {
    pub fn new(config: &ServiceConfig, api_key: Option<String>) -> Result<Self, ServiceError> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| ServiceError::Network(e.to_string()))?;

        let per_second = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = governor::RateLimiter::direct(governor::Quota::per_second(per_second));

        Ok(Self {
            http_client,
            rate_limiter,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key,
            timeout_ms: timeout.as_millis() as u64,
        })
    }
}

#[async_trait::async_trait]
impl GenerationService for HttpGenerationService {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationResponse, ServiceError> {
        self.rate_limiter.until_ready().await;

        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            temperature: request.temperature,
            max_tokens: request.max_output_tokens,
        };

        tracing::debug!(
            endpoint = %self.endpoint,
            prompt_chars = request.prompt.len(),
            "Sending chat completion request"
        );

        let mut builder = self.http_client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ServiceError::Timeout(self.timeout_ms)
            } else {
                ServiceError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ServiceError::Auth);
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ServiceError::RateLimited);
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ServiceError::Api(status.as_u16(), error_text));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::InvalidResponse(e.to_string()))?;

        let text = chat
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| ServiceError::InvalidResponse("response has no message content".to_string()))?;

        let (input_tokens, output_tokens) = match chat.usage {
            Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
            None => (None, None),
        };

        Ok(GenerationResponse {
            text,
            input_tokens,
            output_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_url: &str) -> ServiceConfig {
        serde_json::from_value(serde_json::json!({
            "base_url": base_url,
            "model": "gpt-test",
            "requests_per_second": 0,
        }))
        .unwrap()
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let service = HttpGenerationService::new(&config("http://localhost:8080/v1/"), None).unwrap();
        assert_eq!(service.endpoint, "http://localhost:8080/v1/chat/completions");
        assert_eq!(service.name(), "gpt-test");
        assert_eq!(service.timeout_ms, 60_000);
    }

    #[test]
    fn test_request_body_shape() {
        let body = ChatRequest {
            model: "gpt-test",
            messages: vec![ChatMessage {
                role: "user",
                content: "classify",
            }],
            temperature: 0.0,
            max_tokens: 64,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["messages"][0]["role"], "user");
        assert_eq!(value["messages"][0]["content"], "classify");
        assert_eq!(value["max_tokens"], 64);
    }

    #[test]
    fn test_response_without_usage_or_content_decodes() {
        let chat: ChatResponse =
            serde_json::from_str(r#"{"choices": [{"message": {"content": null}}]}"#).unwrap();
        assert!(chat.usage.is_none());
        assert!(chat.choices[0].message.content.is_none());

        let chat: ChatResponse = serde_json::from_str(
            r#"{"choices": [{"message": {"content": "{}"}}], "usage": {"prompt_tokens": 12, "completion_tokens": 3}}"#,
        )
        .unwrap();
        let usage = chat.usage.unwrap();
        assert_eq!(usage.prompt_tokens, Some(12));
        assert_eq!(usage.completion_tokens, Some(3));
    }
}
