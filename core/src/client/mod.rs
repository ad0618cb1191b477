//! Model client contract, provider dispatch, and the shared retry loop.
//!
//! Providers translate the neutral request/response shapes to their wire
//! formats and map HTTP failures into the error taxonomy; everything above
//! this module only sees [`ModelClient`].

pub mod anthropic;
pub mod openai;

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::Value;
use tracing::warn;

use crate::error::Result;
use crate::error::TetherErr;
use tether_protocol::ItemPayload;
use tether_protocol::ModelConfig;
use tether_protocol::ModelProvider;
use tether_protocol::TokenUsage;
use tether_protocol::WebSearchMode;

pub use anthropic::AnthropicClient;
pub use openai::OpenAiClient;

/// Attempts per model call before a transient failure is surfaced.
pub const MAX_COMPLETION_ATTEMPTS: u32 = 5;

const BACKOFF_BASE: Duration = Duration::from_millis(200);
const BACKOFF_CAP: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: ModelConfig,
    pub base_instructions: String,
    pub developer_instructions: Option<String>,
    pub user_instructions: Option<String>,
    pub history: Vec<ItemPayload>,
    /// Tool specs in the neutral `{name, description, parameters}` shape.
    pub tools: Vec<Value>,
    /// Set when the provider retains conversation state server-side; the
    /// history then carries only the new suffix.
    pub previous_response_id: Option<String>,
    pub web_search_mode: WebSearchMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    Other(String),
}

#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub items: Vec<ItemPayload>,
    pub finish_reason: FinishReason,
    pub usage: TokenUsage,
    pub response_id: Option<String>,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse>;

    /// Produce a compact narrative summary of a transcript, used by the
    /// context compactor.
    async fn summarize(
        &self,
        model: &ModelConfig,
        transcript: &str,
        instructions: &str,
    ) -> Result<String>;

    /// Whether this client (for the given model) retains conversation
    /// state server-side, enabling suffix-only requests.
    fn supports_server_state(&self, _model: &ModelConfig) -> bool {
        false
    }
}

/// Infer the provider from explicit config or the model-name prefix.
pub fn provider_for_model(config: &ModelConfig) -> ModelProvider {
    if let Some(provider) = config.provider {
        return provider;
    }
    if config.model.starts_with("claude") {
        ModelProvider::Anthropic
    } else {
        ModelProvider::Openai
    }
}

/// Exponential backoff with ±10% jitter, capped at ten seconds.
pub fn backoff(attempt: u32) -> Duration {
    let base = BACKOFF_BASE
        .saturating_mul(1u32 << attempt.min(6))
        .min(BACKOFF_CAP);
    let jitter = rand::thread_rng().gen_range(0.9..1.1);
    base.mul_f64(jitter)
}

/// Map an HTTP failure to the error taxonomy. Context-window complaints
/// take precedence over the status code so the compactor gets a chance to
/// run regardless of how the provider reported them.
pub fn classify_http_failure(
    status: u16,
    retry_after: Option<Duration>,
    detail: &str,
) -> TetherErr {
    if looks_like_context_overflow(detail) {
        return TetherErr::ContextOverflow(detail.to_string());
    }
    match status {
        429 => TetherErr::ApiLimit {
            message: detail.to_string(),
            retry_after,
        },
        400 | 401 | 403 | 404 | 422 => {
            TetherErr::Fatal(format!("provider returned {status}: {detail}"))
        }
        408 | 409 => TetherErr::Transient(format!("provider returned {status}: {detail}")),
        s if s >= 500 => TetherErr::Transient(format!("provider returned {s}: {detail}")),
        s => TetherErr::Transient(format!("unexpected status {s}: {detail}")),
    }
}

pub fn looks_like_context_overflow(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("exceeds the context window")
        || lower.contains("exceed the context window")
        || lower.contains("context length exceeded")
        || lower.contains("maximum context length")
        || lower.contains("prompt is too long")
        || (lower.contains("context window")
            && (lower.contains("exceed")
                || lower.contains("full")
                || lower.contains("too long")))
}

/// Map a transport-level failure (no HTTP status) to the taxonomy.
pub fn classify_transport_failure(err: &reqwest::Error) -> TetherErr {
    if err.is_builder() {
        TetherErr::Fatal(format!("request construction failed: {err}"))
    } else {
        TetherErr::Transient(format!("network error: {err}"))
    }
}

/// Drive a completion with retries: transient errors back off
/// exponentially, rate limits honour `Retry-After`, everything else
/// surfaces immediately.
pub async fn complete_with_retries(
    client: &dyn ModelClient,
    request: &ModelRequest,
) -> Result<ModelResponse> {
    let mut attempt: u32 = 0;
    loop {
        match client.complete(request).await {
            Ok(response) => return Ok(response),
            Err(err) if err.is_retryable() && attempt + 1 < MAX_COMPLETION_ATTEMPTS => {
                attempt += 1;
                let delay = match &err {
                    TetherErr::ApiLimit {
                        retry_after: Some(delay),
                        ..
                    } => *delay,
                    _ => backoff(attempt),
                };
                warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "model call failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Routes each call to the provider the model belongs to.
pub struct MultiProviderClient {
    openai: OpenAiClient,
    anthropic: AnthropicClient,
}

impl MultiProviderClient {
    pub fn new() -> Self {
        Self {
            openai: OpenAiClient::from_env(),
            anthropic: AnthropicClient::from_env(),
        }
    }
}

impl Default for MultiProviderClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelClient for MultiProviderClient {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse> {
        match provider_for_model(&request.model) {
            ModelProvider::Openai => self.openai.complete(request).await,
            ModelProvider::Anthropic => self.anthropic.complete(request).await,
        }
    }

    async fn summarize(
        &self,
        model: &ModelConfig,
        transcript: &str,
        instructions: &str,
    ) -> Result<String> {
        match provider_for_model(model) {
            ModelProvider::Anthropic => self.anthropic.summarize(model, transcript, instructions).await,
            ModelProvider::Openai => {
                // Provider-specific summarization failures fall back to the
                // neutral messages path instead of failing compaction.
                match self.openai.summarize(model, transcript, instructions).await {
                    Ok(summary) => Ok(summary),
                    Err(err) if err.is_retryable() => Err(err),
                    Err(err) => {
                        warn!(error = %err, "summarization failed; trying fallback provider");
                        self.anthropic.summarize(model, transcript, instructions).await
                    }
                }
            }
        }
    }

    fn supports_server_state(&self, model: &ModelConfig) -> bool {
        matches!(provider_for_model(model), ModelProvider::Openai)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn status_classification_matches_taxonomy() {
        assert!(matches!(
            classify_http_failure(400, None, "bad request"),
            TetherErr::Fatal(_)
        ));
        assert!(matches!(
            classify_http_failure(401, None, "unauthorized"),
            TetherErr::Fatal(_)
        ));
        assert!(matches!(
            classify_http_failure(403, None, "forbidden"),
            TetherErr::Fatal(_)
        ));
        assert!(matches!(
            classify_http_failure(404, None, "not found"),
            TetherErr::Fatal(_)
        ));
        assert!(matches!(
            classify_http_failure(422, None, "unprocessable"),
            TetherErr::Fatal(_)
        ));
        assert!(matches!(
            classify_http_failure(408, None, "timeout"),
            TetherErr::Transient(_)
        ));
        assert!(matches!(
            classify_http_failure(409, None, "conflict"),
            TetherErr::Transient(_)
        ));
        assert!(matches!(
            classify_http_failure(500, None, "server error"),
            TetherErr::Transient(_)
        ));
        assert!(matches!(
            classify_http_failure(502, None, "bad gateway"),
            TetherErr::Transient(_)
        ));
        assert!(matches!(
            classify_http_failure(503, None, "unavailable"),
            TetherErr::Transient(_)
        ));
    }

    #[test]
    fn rate_limit_carries_retry_after() {
        let err = classify_http_failure(429, Some(Duration::from_secs(7)), "slow down");
        match err {
            TetherErr::ApiLimit { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)));
            }
            other => panic!("unexpected classification: {other:?}"),
        }
    }

    #[test]
    fn context_overflow_wins_over_status() {
        assert!(matches!(
            classify_http_failure(400, None, "This prompt exceeds the context window."),
            TetherErr::ContextOverflow(_)
        ));
        assert!(looks_like_context_overflow("maximum context length is 128000 tokens"));
        assert!(looks_like_context_overflow("prompt is too long: 250000 tokens"));
        assert!(!looks_like_context_overflow("file not found"));
    }

    #[test]
    fn provider_inferred_from_model_prefix() {
        let claude = ModelConfig {
            model: "claude-sonnet-4-5".into(),
            ..Default::default()
        };
        assert_eq!(provider_for_model(&claude), ModelProvider::Anthropic);

        let gpt = ModelConfig {
            model: "gpt-5".into(),
            ..Default::default()
        };
        assert_eq!(provider_for_model(&gpt), ModelProvider::Openai);

        let pinned = ModelConfig {
            model: "claude-sonnet-4-5".into(),
            provider: Some(ModelProvider::Openai),
            ..Default::default()
        };
        assert_eq!(provider_for_model(&pinned), ModelProvider::Openai);
    }

    #[test]
    fn backoff_grows_and_stays_capped() {
        let first = backoff(1);
        let fifth = backoff(5);
        assert!(first >= Duration::from_millis(300));
        assert!(fifth > first);
        for attempt in 0..20 {
            assert!(backoff(attempt) <= Duration::from_secs(11));
        }
    }
}
