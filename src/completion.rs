//! Completion-service client.
//!
//! Two layers:
//! - **[`CompletionService`]** — one attempt against the external service.
//!   [`OpenAiCompatService`] speaks the OpenAI-compatible
//!   `POST {base_url}/chat/completions` protocol (OpenRouter by default).
//! - **[`CompletionClient`]** — wraps a service with the call policy: a
//!   per-call deadline, bounded retries with exponential backoff and jitter,
//!   and cancellation.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited), 5xx and connection errors → retry, up to
//!   `max_retries` times
//! - Malformed or empty completion → retried once
//! - Deadline exceeded → final for that call, never retried
//! - HTTP 401/403 → final, and run-fatal
//! - Other 4xx → final
//! - Backoff: `base × 2^(n-1)` capped at `max`, with the upper half jittered

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::LlmConfig;
use crate::error::{CompletionError, ConfigError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// A fully built request: the chat messages plus the output allowance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub max_output_tokens: u32,
}

impl CompletionRequest {
    /// Concatenated message contents, for size estimation.
    pub fn text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A single attempt against a text-completion backend.
///
/// Implementations classify every failure into a [`CompletionError`]
/// variant; retry and deadline policy belong to [`CompletionClient`].
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Model identifier used for requests.
    fn model(&self) -> &str;

    async fn complete_once(&self, request: &CompletionRequest) -> Result<String, CompletionError>;
}

// ============ OpenAI-compatible HTTP service ============

/// Chat-completions endpoint over HTTP.
pub struct OpenAiCompatService {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    timeout: Duration,
}

impl OpenAiCompatService {
    /// Build from config, reading the API key from the environment.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingCredentials`] when the key variable is unset or
    /// empty; [`ConfigError::Invalid`] when the HTTP client cannot be built.
    pub fn from_config(config: &LlmConfig) -> Result<Self, ConfigError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingCredentials(config.api_key_env.clone()))?;
        Self::new(config, api_key)
    }

    pub fn new(config: &LlmConfig, api_key: String) -> Result<Self, ConfigError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ConfigError::Invalid(format!("http client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            timeout: config.timeout(),
        })
    }
}

#[async_trait]
impl CompletionService for OpenAiCompatService {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete_once(&self, request: &CompletionRequest) -> Result<String, CompletionError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": request.messages,
            "max_tokens": request.max_output_tokens,
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CompletionError::Timeout(self.timeout)
                } else {
                    CompletionError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), body_text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| CompletionError::InvalidResponse(format!("body is not JSON: {e}")))?;
        parse_chat_response(&json)
    }
}

/// Map a non-success HTTP status to an error variant.
fn classify_status(status: u16, body: String) -> CompletionError {
    match status {
        429 => CompletionError::RateLimited(body),
        401 | 403 => CompletionError::Authentication(format!("HTTP {status}: {body}")),
        408 | 500..=599 => CompletionError::Service {
            status,
            message: body,
            retryable: true,
        },
        _ => CompletionError::Service {
            status,
            message: body,
            retryable: false,
        },
    }
}

/// Extract `choices[0].message.content` from a chat-completions payload.
///
/// OpenRouter reports some upstream failures as a 200 with an `error`
/// object; those are mapped back to service errors.
fn parse_chat_response(json: &serde_json::Value) -> Result<String, CompletionError> {
    if let Some(err) = json.get("error") {
        let status = err
            .get("code")
            .and_then(|c| c.as_u64())
            .and_then(|c| u16::try_from(c).ok())
            .unwrap_or(502);
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("upstream error")
            .to_string();
        return Err(classify_status(status, message));
    }

    let content = json
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| {
            CompletionError::InvalidResponse("missing choices[0].message.content".to_string())
        })?;

    if content.trim().is_empty() {
        return Err(CompletionError::InvalidResponse(
            "empty completion".to_string(),
        ));
    }

    Ok(content.to_string())
}

// ============ Retrying client ============

/// Deadline, retry ceiling and backoff shape for completion calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            timeout: config.timeout(),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        }
    }

    /// Delay before retry number `retry` (1-based).
    ///
    /// The exponential step is capped at `backoff_max`; the lower half is
    /// fixed and the upper half drawn uniformly.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        let step = self
            .backoff_base
            .saturating_mul(1u32 << shift)
            .min(self.backoff_max);
        let half = step / 2;
        let jitter_ms = half.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        half + jitter
    }
}

/// Completion calls with deadline, retry and cancellation.
///
/// Cheap to clone; clones share the underlying service.
#[derive(Clone)]
pub struct CompletionClient {
    service: Arc<dyn CompletionService>,
    policy: RetryPolicy,
}

impl CompletionClient {
    pub fn new(service: Arc<dyn CompletionService>, policy: RetryPolicy) -> Self {
        Self { service, policy }
    }

    /// Client over the configured OpenAI-compatible endpoint.
    pub fn from_config(config: &LlmConfig) -> Result<Self, ConfigError> {
        let service = OpenAiCompatService::from_config(config)?;
        Ok(Self::new(Arc::new(service), RetryPolicy::from_config(config)))
    }

    pub fn model(&self) -> &str {
        self.service.model()
    }

    /// Run one completion under the retry policy.
    ///
    /// Returns [`CompletionError::Cancelled`] as soon as `cancel` fires,
    /// whether the call is in flight or waiting out a backoff.
    pub async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<String, CompletionError> {
        let mut retries = 0u32;
        let mut invalid_retried = false;

        loop {
            if cancel.is_cancelled() {
                return Err(CompletionError::Cancelled);
            }

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CompletionError::Cancelled),
                r = tokio::time::timeout(self.policy.timeout, self.service.complete_once(request)) => {
                    r.unwrap_or(Err(CompletionError::Timeout(self.policy.timeout)))
                }
            };

            let err = match attempt {
                Ok(text) => return Ok(text),
                Err(e) => e,
            };

            let retry = match &err {
                CompletionError::InvalidResponse(_) => !std::mem::replace(&mut invalid_retried, true),
                e if e.is_retryable() && retries < self.policy.max_retries => true,
                _ => false,
            };
            if !retry {
                tracing::debug!(error = %err, retries, "completion call failed");
                return Err(err);
            }

            retries += 1;
            let delay = self.policy.backoff_delay(retries);
            tracing::warn!(
                error = %err,
                retry = retries,
                delay_ms = delay.as_millis() as u64,
                "completion call failed, retrying"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CompletionError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
