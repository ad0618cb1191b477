//! Responses-API-shaped provider.
//!
//! This provider retains conversation state server-side, so requests may
//! carry only the new item suffix plus `previous_response_id`.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use serde_json::Value;
use tracing::debug;

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
use tether_protocol::WebSearchMode;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAiClient {
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
            std::env::var("OPENAI_API_KEY").ok(),
            std::env::var("OPENAI_BASE_URL").ok(),
        )
    }

    fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| TetherErr::Fatal("OPENAI_API_KEY is not set".into()))
    }

    async fn post_responses(&self, body: &Value) -> Result<Value> {
        let key = self.api_key()?;
        let response = self
            .http
            .post(format!("{}/responses", self.base_url))
            .bearer_auth(key)
            .json(body)
            .send()
            .await
            .map_err(|err| classify_transport_failure(&err))?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let text = response
            .text()
            .await
            .map_err(|err| classify_transport_failure(&err))?;

        if !status.is_success() {
            let detail = extract_error_message(&text).unwrap_or_else(|| text.clone());
            return Err(classify_http_failure(status.as_u16(), retry_after, &detail));
        }

        serde_json::from_str(&text)
            .map_err(|err| TetherErr::Transient(format!("malformed provider response: {err}")))
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse> {
        let mut body = json!({
            "model": request.model.model,
            "instructions": request.base_instructions,
            "input": build_input(request),
            "temperature": request.model.temperature,
            "max_output_tokens": request.model.max_tokens,
            "store": true,
        });

        let mut tools = request.tools.clone();
        if request.web_search_mode != WebSearchMode::Disabled {
            tools.push(json!({"type": "web_search"}));
        }
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }
        if let Some(previous) = &request.previous_response_id {
            body["previous_response_id"] = Value::String(previous.clone());
        }

        let raw = self.post_responses(&body).await?;
        debug!(response_id = raw["id"].as_str(), "model response received");
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
            "instructions": instructions,
            "input": [message_value("user", "input_text", transcript)],
            "max_output_tokens": model.max_tokens,
            "store": false,
        });

        let raw = self.post_responses(&body).await?;
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

    fn supports_server_state(&self, _model: &ModelConfig) -> bool {
        true
    }
}

fn message_value(role: &str, content_type: &str, text: &str) -> Value {
    json!({
        "type": "message",
        "role": role,
        "content": [{"type": content_type, "text": text}],
    })
}

fn build_input(request: &ModelRequest) -> Vec<Value> {
    let mut input = Vec::new();

    // Instruction roles only accompany full-history requests; with
    // `previous_response_id` the server already has them.
    if request.previous_response_id.is_none() {
        if let Some(developer) = &request.developer_instructions {
            if !developer.is_empty() {
                input.push(message_value("developer", "input_text", developer));
            }
        }
        if let Some(user) = &request.user_instructions {
            if !user.is_empty() {
                input.push(message_value("user", "input_text", user));
            }
        }
    }

    for item in &request.history {
        match item {
            ItemPayload::UserMessage { content } => {
                input.push(message_value("user", "input_text", content));
            }
            ItemPayload::AssistantMessage { content } => {
                input.push(message_value("assistant", "output_text", content));
            }
            ItemPayload::FunctionCall {
                call_id,
                name,
                arguments,
            } => {
                input.push(json!({
                    "type": "function_call",
                    "call_id": call_id,
                    "name": name,
                    "arguments": arguments,
                }));
            }
            ItemPayload::FunctionCallOutput { call_id, output } => {
                input.push(json!({
                    "type": "function_call_output",
                    "call_id": call_id,
                    "output": output.content,
                }));
            }
            ItemPayload::WebSearchCall { detail, .. } => {
                // Fed back verbatim when the original wire item survived.
                if let Ok(original) = serde_json::from_str::<Value>(detail) {
                    input.push(original);
                }
            }
            ItemPayload::TurnStarted { .. }
            | ItemPayload::TurnComplete { .. }
            | ItemPayload::Compaction { .. } => {}
        }
    }

    input
}

fn parse_response(raw: &Value) -> ModelResponse {
    let mut items = Vec::new();
    let mut saw_function_call = false;

    for entry in raw["output"].as_array().into_iter().flatten() {
        match entry["type"].as_str() {
            Some("message") => {
                let mut text = String::new();
                for block in entry["content"].as_array().into_iter().flatten() {
                    if let Some(t) = block["text"].as_str() {
                        text.push_str(t);
                    }
                }
                if !text.is_empty() {
                    items.push(ItemPayload::AssistantMessage { content: text });
                }
            }
            Some("function_call") => {
                saw_function_call = true;
                items.push(ItemPayload::FunctionCall {
                    call_id: entry["call_id"].as_str().unwrap_or_default().to_string(),
                    name: entry["name"].as_str().unwrap_or_default().to_string(),
                    arguments: entry["arguments"].as_str().unwrap_or("{}").to_string(),
                });
            }
            Some("web_search_call") => {
                items.push(ItemPayload::WebSearchCall {
                    call_id: entry["id"].as_str().unwrap_or_default().to_string(),
                    action: entry["action"]["type"]
                        .as_str()
                        .unwrap_or("search")
                        .to_string(),
                    detail: entry.to_string(),
                });
            }
            _ => {}
        }
    }

    let finish_reason = if raw["status"].as_str() == Some("incomplete") {
        match raw["incomplete_details"]["reason"].as_str() {
            Some("max_output_tokens") => FinishReason::Length,
            Some(other) => FinishReason::Other(other.to_string()),
            None => FinishReason::Other("incomplete".to_string()),
        }
    } else if saw_function_call {
        FinishReason::ToolCalls
    } else {
        FinishReason::Stop
    };

    let usage = &raw["usage"];
    let prompt = usage["input_tokens"].as_u64().unwrap_or(0);
    let completion = usage["output_tokens"].as_u64().unwrap_or(0);
    let usage = TokenUsage {
        prompt,
        completion,
        cached: usage["input_tokens_details"]["cached_tokens"]
            .as_u64()
            .unwrap_or(0),
        total: usage["total_tokens"].as_u64().unwrap_or(prompt + completion),
    };

    ModelResponse {
        items,
        finish_reason,
        usage,
        response_id: raw["id"].as_str().map(str::to_string),
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

fn extract_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    value["error"]["message"].as_str().map(str::to_string)
}
