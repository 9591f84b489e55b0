//! LLM gateway abstraction and the OpenAI-compatible HTTP implementation.
//!
//! The core only ever talks to `LlmGateway::complete`, so tests substitute a
//! scripted gateway and the pipeline never knows the difference.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::KilnConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    /// Set on tool-result messages to correlate with the originating call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Set on assistant messages that requested tool calls, so the exchange
    /// can be echoed back to the model on the next round.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Some(calls),
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            content: content.into(),
            tool_call_id: Some(call_id.into()),
            tool_calls: None,
        }
    }
}

/// Schema for one tool exposed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's arguments.
    pub parameters: serde_json::Value,
}

/// A structured tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
}

#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion>;
}

/// OpenAI-compatible chat completions client.
pub struct HttpGateway {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl HttpGateway {
    pub fn from_config(config: &KilnConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .context("No API key configured; set KILN_API_KEY")?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

/// Scripted gateway that replays a fixed sequence of completions.
/// Test double for `HttpGateway`; panics when the script runs dry.
pub struct ScriptedGateway {
    script: std::sync::Mutex<std::collections::VecDeque<Completion>>,
    requests: std::sync::Mutex<Vec<CompletionRequest>>,
}

impl ScriptedGateway {
    pub fn new(completions: Vec<Completion>) -> Self {
        Self {
            script: std::sync::Mutex::new(completions.into()),
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Requests seen so far, for assertions on prompts and tool schemas.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().expect("script lock").len()
    }
}

#[async_trait]
impl LlmGateway for ScriptedGateway {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        self.requests.lock().expect("requests lock").push(request);
        self.script
            .lock()
            .expect("script lock")
            .pop_front()
            .ok_or_else(|| anyhow!("ScriptedGateway ran out of completions"))
    }
}

// Wire types for the chat completions protocol.

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool<'a>>,
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Serialize)]
struct WireTool<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    function: &'a ToolSpec,
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
    /// JSON-encoded argument object, per the wire protocol.
    arguments: String,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireMessage,
}

fn role_name(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
        ChatRole::Tool => "tool",
    }
}

fn to_wire_messages(system: &str, messages: &[ChatMessage]) -> Vec<WireMessage> {
    let mut wire = Vec::with_capacity(messages.len() + 1);
    wire.push(WireMessage {
        role: "system".to_string(),
        content: Some(system.to_string()),
        tool_call_id: None,
        tool_calls: None,
    });
    for msg in messages {
        let tool_calls = msg.tool_calls.as_ref().map(|calls| {
            calls
                .iter()
                .map(|call| WireToolCall {
                    id: call.id.clone(),
                    kind: "function".to_string(),
                    function: WireFunction {
                        name: call.name.clone(),
                        arguments: call.arguments.to_string(),
                    },
                })
                .collect()
        });
        wire.push(WireMessage {
            role: role_name(msg.role).to_string(),
            content: Some(msg.content.clone()),
            tool_call_id: msg.tool_call_id.clone(),
            tool_calls,
        });
    }
    wire
}

fn parse_wire_message(message: WireMessage) -> Result<Completion> {
    let mut tool_calls = Vec::new();
    if let Some(calls) = message.tool_calls {
        for call in calls {
            let arguments: serde_json::Value = serde_json::from_str(&call.function.arguments)
                .with_context(|| {
                    format!("Tool call '{}' returned invalid JSON arguments", call.function.name)
                })?;
            tool_calls.push(ToolCall {
                id: call.id,
                name: call.function.name,
                arguments,
            });
        }
    }
    Ok(Completion {
        text: message.content.unwrap_or_default(),
        tool_calls,
    })
}

#[async_trait]
impl LlmGateway for HttpGateway {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        let body = WireRequest {
            model: &request.model,
            messages: to_wire_messages(&request.system, &request.messages),
            tools: request
                .tools
                .iter()
                .map(|spec| WireTool {
                    kind: "function",
                    function: spec,
                })
                .collect(),
        };

        let url = format!("{}/chat/completions", self.api_base);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("LLM gateway request failed")?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(anyhow!("LLM gateway returned {}: {}", status, detail));
        }

        let mut parsed: WireResponse = response
            .json()
            .await
            .context("Failed to decode LLM gateway response")?;
        if parsed.choices.is_empty() {
            return Err(anyhow!("LLM gateway returned no choices"));
        }
        parse_wire_message(parsed.choices.remove(0).message)
    }
}
