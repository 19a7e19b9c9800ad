//! A single OpenAI-compatible chat-completions client
//! (`OPENAI_API_KEY`/`OPENAI_BASE_URL`/`OPENAI_MODEL`).
//!
//! The turn orchestrator only depends on the [`LlmClient`] trait, so tests
//! can inject a fake that returns canned [`ChatResponse`]s instead of making
//! a network call — a capability object over a singleton.

mod error;

pub use error::{LlmError, Result};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Role in a chat conversation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in the working conversation sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: Some(content.into()), tool_calls: vec![], tool_call_id: None }
    }
    pub fn assistant_tool_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self { role: ChatRole::Assistant, content, tool_calls, tool_call_id: None }
    }
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: ChatRole::Tool, content: Some(content.into()), tool_calls: vec![], tool_call_id: Some(tool_call_id.into()) }
    }
}

/// A tool call requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_tool_call_type")]
    pub r#type: String,
    pub function: ToolCallFunction,
}

fn default_tool_call_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Result of one non-streaming completion round.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: String,
}

/// The seam the turn orchestrator depends on instead of a concrete HTTP
/// client, so tests can substitute a scripted fake.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&Value>,
    ) -> Result<ChatResponse>;
}

/// Production [`LlmClient`] over any OpenAI-compatible `/chat/completions`
/// endpoint.
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key,
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: Option<&Value>,
    ) -> Result<ChatResponse> {
        let endpoint = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut payload = json!({
            "model": model,
            "messages": messages_to_openai(messages),
        });
        if let Some(tools) = tools {
            payload["tools"] = tools.clone();
            payload["tool_choice"] = json!("auto");
        }

        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| LlmError::Upstream(e.to_string()))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| LlmError::Upstream(format!("invalid response body: {e}")))?;

        if !status.is_success() {
            let message = body
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("request failed");
            tracing::warn!(%status, model, "chat completion request failed");
            return Err(LlmError::Upstream(format!("{status}: {message}")));
        }

        parse_openai_chat_response(&body)
    }
}

fn messages_to_openai(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            let role = match m.role {
                ChatRole::System => "system",
                ChatRole::User => "user",
                ChatRole::Assistant => "assistant",
                ChatRole::Tool => "tool",
            };
            let mut msg = json!({ "role": role, "content": m.content });
            if !m.tool_calls.is_empty() {
                let calls: Vec<Value> = m
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.function.name,
                                "arguments": tc.function.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
                msg["tool_calls"] = json!(calls);
            }
            if let Some(ref id) = m.tool_call_id {
                msg["tool_call_id"] = json!(id);
            }
            msg
        })
        .collect()
}

fn parse_openai_chat_response(body: &Value) -> Result<ChatResponse> {
    let choice = body.get("choices").and_then(|c| c.get(0));
    let message = choice.and_then(|c| c.get("message"));

    let content = message
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .map(|s| s.to_string());

    let finish_reason = choice
        .and_then(|c| c.get("finish_reason"))
        .and_then(Value::as_str)
        .unwrap_or("stop")
        .to_string();

    let tool_calls = message
        .and_then(|m| m.get("tool_calls"))
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .filter_map(|(i, tc)| {
                    let id = tc.get("id").and_then(Value::as_str).unwrap_or("").to_string();
                    let func = tc.get("function")?;
                    let name = func.get("name")?.as_str()?.to_string();
                    let arguments = func
                        .get("arguments")
                        .and_then(Value::as_str)
                        .map(|s| serde_json::from_str(s).unwrap_or(json!({})))
                        .unwrap_or(json!({}));
                    Some(ToolCall {
                        id: if id.is_empty() { format!("call_{i}") } else { id },
                        r#type: "function".to_string(),
                        function: ToolCallFunction { name, arguments },
                    })
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    Ok(ChatResponse { content, tool_calls, finish_reason })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_text_response() {
        let body = json!({
            "choices": [{
                "message": {"role": "assistant", "content": "hi there."},
                "finish_reason": "stop"
            }]
        });
        let response = parse_openai_chat_response(&body).unwrap();
        assert_eq!(response.content.as_deref(), Some("hi there."));
        assert!(response.tool_calls.is_empty());
        assert_eq!(response.finish_reason, "stop");
    }

    #[test]
    fn parses_tool_call_response() {
        let body = json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "run_command", "arguments": "{\"command\":\"echo hi\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let response = parse_openai_chat_response(&body).unwrap();
        assert!(response.content.is_none());
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].function.name, "run_command");
        assert_eq!(response.tool_calls[0].function.arguments["command"], "echo hi");
    }

    #[test]
    fn tool_call_missing_id_gets_synthesized() {
        let body = json!({
            "choices": [{
                "message": {
                    "tool_calls": [{
                        "type": "function",
                        "function": {"name": "read_file", "arguments": "{}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        });
        let response = parse_openai_chat_response(&body).unwrap();
        assert_eq!(response.tool_calls[0].id, "call_0");
    }

    #[test]
    fn messages_round_trip_tool_call_and_result() {
        let messages = vec![
            ChatMessage::user("echo hi"),
            ChatMessage::assistant_tool_calls(
                None,
                vec![ToolCall {
                    id: "call_1".to_string(),
                    r#type: "function".to_string(),
                    function: ToolCallFunction { name: "run_command".to_string(), arguments: json!({"command": "echo hi"}) },
                }],
            ),
            ChatMessage::tool_result("call_1", r#"{"exitCode":0,"stdout":"hi\n"}"#),
        ];
        let rendered = messages_to_openai(&messages);
        assert_eq!(rendered[1]["tool_calls"][0]["function"]["name"], "run_command");
        assert_eq!(rendered[2]["tool_call_id"], "call_1");
    }
}
