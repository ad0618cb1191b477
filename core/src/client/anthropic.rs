//! Messages-API-shaped provider.
//!
//! No server-side conversation state: every request carries the full
//! rebuilt history. Also serves as the neutral fallback target for
//! summarization.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use serde_json::Value;

use crate::client::classify_http_failure;
use crate::client::classify_transport_failure;
use crate::client::FinishReason;
use crate::client::ModelClient;
use crate::client::ModelRequest;
use crate::client::ModelResponse;
use crate::error::Result;
use crate::error::TetherErr;
use tether_protocol::ItemPayload;
use tether_protocol::ModelConfig;
use tether_protocol::TokenUsage;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl AnthropicClient {
    pub fn new(api_key: Option<String>, base_url: Option<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            std::env::var("ANTHROPIC_API_KEY").ok(),
            std::env::var("ANTHROPIC_BASE_URL").ok(),
        )
    }

    async fn post_messages(&self, body: &Value) -> Result<Value> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| TetherErr::Fatal("ANTHROPIC_API_KEY is not set".into()))?;

        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", API_VERSION)
            .json(body)
            .send()
            .await
            .map_err(|err| classify_transport_failure(&err))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = response
            .text()
            .await
            .map_err(|err| classify_transport_failure(&err))?;

        if !status.is_success() {
            let detail = extract_error_message(&text).unwrap_or_else(|| text.clone());
            // The dedicated overloaded status is retryable like any 5xx.
            let code = if status.as_u16() == 529 { 503 } else { status.as_u16() };
            return Err(classify_http_failure(code, retry_after, &detail));
        }

        serde_json::from_str(&text)
            .map_err(|err| TetherErr::Transient(format!("malformed provider response: {err}")))
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse> {
        let mut body = json!({
            "model": request.model.model,
            "max_tokens": request.model.max_tokens,
            "temperature": request.model.temperature,
            "system": build_system(request),
            "messages": build_messages(&request.history),
        });

        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(convert_tool_spec)
                    .collect::<Vec<Value>>(),
            );
        }

        let raw = self.post_messages(&body).await?;
        Ok(parse_response(&raw))
    }

    async fn summarize(
        &self,
        model: &ModelConfig,
        transcript: &str,
        instructions: &str,
    ) -> Result<String> {
        let body = json!({
            "model": model.model,
            "max_tokens": model.max_tokens,
            "system": instructions,
            "messages": [{"role": "user", "content": [{"type": "text", "text": transcript}]}],
        });

        let raw = self.post_messages(&body).await?;
        let parsed = parse_response(&raw);
        for item in parsed.items {
            if let ItemPayload::AssistantMessage { content } = item {
                if !content.is_empty() {
                    return Ok(content);
                }
            }
        }
        Err(TetherErr::Transient(
            "summarization response contained no text".into(),
        ))
    }
}

fn build_system(request: &ModelRequest) -> String {
    let mut parts = vec![request.base_instructions.as_str()];
    if let Some(developer) = request.developer_instructions.as_deref() {
        if !developer.is_empty() {
            parts.push(developer);
        }
    }
    if let Some(user) = request.user_instructions.as_deref() {
        if !user.is_empty() {
            parts.push(user);
        }
    }
    parts.join("\n\n")
}

/// Map history to alternating-role messages, merging consecutive blocks of
/// the same role.
fn build_messages(history: &[ItemPayload]) -> Vec<Value> {
    let mut messages: Vec<(String, Vec<Value>)> = Vec::new();

    let mut push_block = |role: &str, block: Value| match messages.last_mut() {
        Some((last_role, blocks)) if last_role == role => blocks.push(block),
        _ => messages.push((role.to_string(), vec![block])),
    };

    for item in history {
        match item {
            ItemPayload::UserMessage { content } => {
                push_block("user", json!({"type": "text", "text": content}));
            }
            ItemPayload::AssistantMessage { content } => {
                push_block("assistant", json!({"type": "text", "text": content}));
            }
            ItemPayload::FunctionCall {
                call_id,
                name,
                arguments,
            } => {
                let input: Value =
                    serde_json::from_str(arguments).unwrap_or_else(|_| json!({}));
                push_block(
                    "assistant",
                    json!({"type": "tool_use", "id": call_id, "name": name, "input": input}),
                );
            }
            ItemPayload::FunctionCallOutput { call_id, output } => {
                push_block(
                    "user",
                    json!({
                        "type": "tool_result",
                        "tool_use_id": call_id,
                        "content": output.content,
                        "is_error": output.is_failure(),
                    }),
                );
            }
            ItemPayload::WebSearchCall { .. }
            | ItemPayload::TurnStarted { .. }
            | ItemPayload::TurnComplete { .. }
            | ItemPayload::Compaction { .. } => {}
        }
    }

    messages
        .into_iter()
        .map(|(role, blocks)| json!({"role": role, "content": blocks}))
        .collect()
}

/// `{name, description, parameters}` → `{name, description, input_schema}`.
fn convert_tool_spec(spec: &Value) -> Value {
    json!({
        "name": spec["name"],
        "description": spec["description"],
        "input_schema": spec["parameters"],
    })
}

fn parse_response(raw: &Value) -> ModelResponse {
    let mut items = Vec::new();
    let mut saw_tool_use = false;

    for block in raw["content"].as_array().into_iter().flatten() {
        match block["type"].as_str() {
            Some("text") => {
                if let Some(text) = block["text"].as_str() {
                    if !text.is_empty() {
                        items.push(ItemPayload::AssistantMessage {
                            content: text.to_string(),
                        });
                    }
                }
            }
            Some("tool_use") => {
                saw_tool_use = true;
                items.push(ItemPayload::FunctionCall {
                    call_id: block["id"].as_str().unwrap_or_default().to_string(),
                    name: block["name"].as_str().unwrap_or_default().to_string(),
                    arguments: block["input"].to_string(),
                });
            }
            _ => {}
        }
    }

    let finish_reason = match raw["stop_reason"].as_str() {
        Some("tool_use") => FinishReason::ToolCalls,
        Some("max_tokens") => FinishReason::Length,
        Some("end_turn") | Some("stop_sequence") | None => {
            if saw_tool_use {
                FinishReason::ToolCalls
            } else {
                FinishReason::Stop
            }
        }
        Some(other) => FinishReason::Other(other.to_string()),
    };

    let usage = &raw["usage"];
    let prompt = usage["input_tokens"].as_u64().unwrap_or(0);
    let completion = usage["output_tokens"].as_u64().unwrap_or(0);
    let cached = usage["cache_read_input_tokens"].as_u64().unwrap_or(0);
    let usage = TokenUsage {
        prompt,
        completion,
        cached,
        total: prompt + completion,
    };

    ModelResponse {
        items,
        finish_reason,
        usage,
        response_id: raw["id"].as_str().map(str::to_string),
    }
}

fn extract_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value["error"]["message"].as_str().map(str::to_string)
}
