//! Chat-model abstraction and the OpenAI-compatible HTTP client.
//!
//! The engine addresses LLM backends through the [`ChatModel`] trait only.
//! [`OpenAiCompatClient`] is the one concrete implementation shipped here;
//! it speaks the `/chat/completions` dialect that OpenAI, TabbyAPI, vLLM,
//! Ollama and friends share, with function-style tool calls and no
//! streaming (the engine is strictly sequential; chunked delivery is the
//! dispatcher's concern, not the transport's).

use async_trait::async_trait;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::ModelEndpoint;

/// A single conversation message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    /// Tool calls the assistant requested (assistant messages only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// Which tool call this message answers (tool messages only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub const SYSTEM: &'static str = "system";
    pub const USER: &'static str = "user";
    pub const ASSISTANT: &'static str = "assistant";
    pub const TOOL: &'static str = "tool";

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Self::SYSTEM.into(),
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Self::USER.into(),
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Self::ASSISTANT.into(),
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Self::TOOL.into(),
            content: content.into(),
            tool_call_id: Some(call_id.into()),
            ..Self::default()
        }
    }
}

/// A tool call requested by the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Declared tool shape advertised to the model.
#[derive(Clone, Debug, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// One completion request.
#[derive(Clone, Debug)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub max_tokens: u32,
}

impl ChatRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            max_tokens: 16_384,
        }
    }
}

/// One completion response: answer text and/or requested tool calls.
#[derive(Clone, Debug, Default)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
}

/// Transport and protocol errors from a chat backend.
#[derive(Debug, Error, Diagnostic)]
pub enum ChatError {
    #[error("chat transport error: {source}")]
    #[diagnostic(code(gaffer::chat::transport))]
    Transport {
        #[source]
        source: reqwest::Error,
    },

    #[error("chat API error ({status}): {message}")]
    #[diagnostic(code(gaffer::chat::api))]
    Api { status: u16, message: String },

    #[error("malformed chat response: {message}")]
    #[diagnostic(code(gaffer::chat::malformed))]
    Malformed { message: String },

    #[error("scripted model exhausted its replies")]
    #[diagnostic(code(gaffer::chat::exhausted))]
    Exhausted,
}

impl ChatError {
    /// Whether a call to the fallback (primary) model is worth attempting.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        match self {
            ChatError::Transport { .. } => true,
            ChatError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// A role-bindable chat backend.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Human-readable identity for logs and degradation warnings.
    fn label(&self) -> String;
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ChatError>;
}

// ---------------------------------------------------------------------------
// OpenAI-compatible wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<&'a str>,
}

#[derive(Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: WireFunction,
}

#[derive(Serialize, Deserialize)]
struct WireFunction {
    name: String,
    /// JSON-encoded argument object, per the OpenAI dialect.
    arguments: String,
}

#[derive(Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    function: &'a ToolSpec,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
}

#[derive(Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

/// OpenAI-compatible chat client bound to one configured endpoint.
pub struct OpenAiCompatClient {
    http: reqwest::Client,
    endpoint: ModelEndpoint,
}

impl OpenAiCompatClient {
    #[must_use]
    pub fn new(endpoint: ModelEndpoint) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
        }
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.endpoint.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ChatModel for OpenAiCompatClient {
    fn label(&self) -> String {
        format!("{}:{}", self.endpoint.provider, self.endpoint.model)
    }

    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ChatError> {
        let messages: Vec<WireMessage<'_>> = request
            .messages
            .iter()
            .map(|m| WireMessage {
                role: &m.role,
                content: &m.content,
                tool_calls: if m.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        m.tool_calls
                            .iter()
                            .map(|c| WireToolCall {
                                id: c.id.clone(),
                                kind: "function".into(),
                                function: WireFunction {
                                    name: c.name.clone(),
                                    arguments: c.arguments.to_string(),
                                },
                            })
                            .collect(),
                    )
                },
                tool_call_id: m.tool_call_id.as_deref(),
            })
            .collect();
        let tools: Vec<WireTool<'_>> = request
            .tools
            .iter()
            .map(|t| WireTool {
                kind: "function",
                function: t,
            })
            .collect();
        let body = WireRequest {
            model: &self.endpoint.model,
            messages,
            max_tokens: request.max_tokens,
            stream: false,
            tools,
        };

        let mut http_request = self.http.post(self.completions_url()).json(&body);
        if let Some(key) = self.endpoint.resolve_api_key() {
            http_request = http_request.bearer_auth(key);
        }
        let response = http_request
            .send()
            .await
            .map_err(|source| ChatError::Transport { source })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ChatError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|source| ChatError::Transport { source })?;
        let choice = wire.choices.into_iter().next().ok_or(ChatError::Malformed {
            message: "response contained no choices".into(),
        })?;

        let mut tool_calls = Vec::new();
        for call in choice.message.tool_calls.unwrap_or_default() {
            let arguments: Value =
                serde_json::from_str(&call.function.arguments).unwrap_or(Value::Null);
            tool_calls.push(ToolCallRequest {
                id: call.id,
                name: call.function.name,
                arguments,
            });
        }

        Ok(ChatResponse {
            content: choice.message.content.unwrap_or_default(),
            tool_calls,
        })
    }
}

/// Rough token estimate used for all budget arithmetic: four characters per
/// token, the conventional approximation for mixed code and prose.
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Token estimate for a whole conversation.
#[must_use]
pub fn estimate_conversation_tokens(messages: &[ChatMessage]) -> usize {
    messages
        .iter()
        .map(|m| estimate_tokens(&m.content) + 4)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn unavailable_classification() {
        assert!(ChatError::Api {
            status: 503,
            message: String::new()
        }
        .is_unavailable());
        assert!(!ChatError::Api {
            status: 400,
            message: String::new()
        }
        .is_unavailable());
        assert!(!ChatError::Malformed {
            message: String::new()
        }
        .is_unavailable());
    }
}
