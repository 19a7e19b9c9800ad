//! Tagged turn events — "tagged variants replace the informal event union"
//! — and the sink trait the orchestrator emits them
//! through.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "type")]
pub enum TurnEvent {
    #[serde(rename = "conversation")]
    Conversation { conversation_id: String },
    #[serde(rename = "assistant_bubble_start")]
    AssistantBubbleStart { bubble_id: String },
    #[serde(rename = "token")]
    Token { bubble_id: String, value: String },
    #[serde(rename = "tool_call_started")]
    ToolCallStarted { tool_call_id: String, tool_name: String, args: Value },
    #[serde(rename = "tool_call_output")]
    ToolCallOutput { tool_call_id: String, output_preview: String },
    #[serde(rename = "tool_call_finished")]
    ToolCallFinished { tool_call_id: String, ok: bool, output: Value },
    #[serde(rename = "assistant_done")]
    AssistantDone,
    #[serde(rename = "error")]
    Error { message: String },
}

/// Callback surface for one turn: an optional callback sink. Every method
/// has a no-op default so callers that only care about the
/// final `{conversationId, messageIds, bubbles}` return value — e.g. the
/// trigger-run executor, which invokes the orchestrator "with no callbacks"
/// — can implement nothing at all.
pub trait EventSink: Send + Sync {
    fn on_conversation(&self, _conversation_id: &str) {}
    fn on_assistant_bubble_start(&self, _bubble_id: &str) {}
    fn on_assistant_token(&self, _bubble_id: &str, _value: &str) {}
    fn on_tool_call_started(&self, _tool_call_id: &str, _tool_name: &str, _args: &Value) {}
    fn on_tool_call_output(&self, _tool_call_id: &str, _output_preview: &str) {}
    fn on_tool_call_finished(&self, _tool_call_id: &str, _ok: bool, _output: &Value) {}
    fn on_assistant_done(&self) {}
    fn on_error(&self, _message: &str) {}
}

/// The sink used when a turn runs with no callbacks.
pub struct NullSink;

impl EventSink for NullSink {}
