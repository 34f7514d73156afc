//! Anthropic Messages API provider

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use serde_json::json;

use super::ModelProvider;
use crate::{
    decoder::{ProtocolEventStream, decode_stream},
    error::{Error, Result},
    types::{ContentBlock, Context, Model, Role, ToolDefinition},
};

const API_VERSION: &str = "2023-06-01";

/// Anthropic API client
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider with an API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
        }
    }

    /// Create from the `ANTHROPIC_API_KEY` environment variable
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| Error::InvalidApiKey)?;
        if api_key.trim().is_empty() {
            return Err(Error::InvalidApiKey);
        }
        Ok(Self::new(api_key))
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let mut insert = |name: &'static str, value: &str| -> Result<()> {
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::InvalidConfig(format!("invalid header value for {name}: {e}")))?;
            headers.insert(HeaderName::from_static(name), value);
            Ok(())
        };
        insert("x-api-key", &self.api_key)?;
        insert("anthropic-version", API_VERSION)?;
        insert("accept", "text/event-stream")?;
        insert("content-type", "application/json")?;
        Ok(headers)
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    async fn stream(&self, model: &Model, context: &Context) -> Result<ProtocolEventStream> {
        let request = build_request(model, context);
        let url = format!("{}/v1/messages", model.base_url.trim_end_matches('/'));

        tracing::debug!(url = %url, model = %model.id, messages = request.messages.len(), "Opening model stream");

        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    Error::Network(e.to_string())
                } else {
                    Error::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), retry_after, &body));
        }

        Ok(decode_stream(response.bytes_stream()))
    }
}

/// Map a non-success HTTP response to an error
fn status_error(status: u16, retry_after: Option<u64>, body: &str) -> Error {
    if status == 429 {
        return Error::RateLimited { retry_after };
    }
    if status == 401 {
        return Error::InvalidApiKey;
    }

    let parsed: Option<(String, String)> = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            let error = v.get("error")?;
            Some((
                error.get("type")?.as_str()?.to_string(),
                error.get("message")?.as_str()?.to_string(),
            ))
        });

    match parsed {
        Some((error_type, message)) => Error::api(error_type, message),
        None if status >= 500 => Error::api("api_error", format!("HTTP {status}: {body}")),
        None => Error::api("http_error", format!("HTTP {status}: {body}")),
    }
}

// ============================================================================
// Request types
// ============================================================================

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    messages: Vec<AnthropicMessage>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDefinition>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<serde_json::Value>,
}

fn build_request(model: &Model, context: &Context) -> AnthropicRequest {
    let (system, messages) = convert_messages(context);
    AnthropicRequest {
        model: model.id.clone(),
        messages,
        max_tokens: model.max_tokens,
        stream: true,
        system,
        tools: context.tools.clone(),
    }
}

/// System-role history entries (compaction summaries) join the system prompt.
fn convert_messages(context: &Context) -> (Option<String>, Vec<AnthropicMessage>) {
    let mut system_parts: Vec<String> = context.system_prompt.iter().cloned().collect();
    let mut result = Vec::with_capacity(context.messages.len());

    for message in &context.messages {
        let role = match message.role {
            Role::System => {
                let text = message.text();
                if !text.is_empty() {
                    system_parts.push(text);
                }
                continue;
            }
            Role::User => "user",
            Role::Assistant => "assistant",
        };

        let content: Vec<serde_json::Value> = message.content.iter().filter_map(convert_block).collect();
        if !content.is_empty() {
            result.push(AnthropicMessage { role, content });
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system, result)
}

fn convert_block(block: &ContentBlock) -> Option<serde_json::Value> {
    match block {
        ContentBlock::Text { text } if text.is_empty() => None,
        ContentBlock::Text { text } => Some(json!({ "type": "text", "text": text })),
        // Unsigned thinking cannot be replayed as a thinking block
        ContentBlock::Thinking { text } => Some(json!({
            "type": "text",
            "text": format!("<thinking>\n{text}\n</thinking>"),
        })),
        ContentBlock::ToolUse { id, name, input } => {
            let input = if input.is_object() {
                input.clone()
            } else {
                json!({ "raw": input })
            };
            Some(json!({ "type": "tool_use", "id": id, "name": name, "input": input }))
        }
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => Some(json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": content,
            "is_error": is_error,
        })),
    }
}
