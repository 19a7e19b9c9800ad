//! The turn orchestrator: resolves a conversation, runs the bounded
//! tool-call loop against the LLM, and streams the resulting bubbles
//! through an [`EventSink`].

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use shrimp_config::AppConfig;
use shrimp_llm::{ChatMessage, LlmClient};
use shrimp_store::{Attachment, Channel, Conversation, Role, Store, DEFAULT_CONVERSATION_TITLE};
use shrimp_tools::ToolRegistry;

use crate::bubbles::split_into_bubbles;
use crate::cancellation::CancellationToken;
use crate::error::{Result, RuntimeError};
use crate::events::{EventSink, NullSink};
use crate::history::build_history;

/// Bounded iterations of the tool-call loop: one round is an LLM call plus,
/// if requested, the tool calls it asked for.
const MAX_TOOL_ITERATIONS: u32 = 8;

/// Token-chunk size and pacing for bubble streaming.
const TOKEN_CHUNK_CHARS: usize = 20;
const TOKEN_CHUNK_DELAY: Duration = Duration::from_millis(14);
const INTER_BUBBLE_DELAY: Duration = Duration::from_millis(120);

const TOOL_OUTPUT_PREVIEW_CHARS: usize = 800;
const DEFAULT_TITLE_CHARS: usize = 60;

/// Inputs to one turn.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub conversation_id: Option<String>,
    pub message: String,
    pub model: Option<String>,
    pub reply_to_message_id: Option<String>,
    pub attachments: Vec<Attachment>,
}

/// Outputs of one turn.
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub conversation_id: String,
    pub message_ids: Vec<String>,
    pub bubbles: Vec<String>,
}

/// Wires the config, store, LLM client, and tool registry the orchestrator
/// depends on — capability objects, not global singletons.
pub struct Runtime {
    pub config: AppConfig,
    pub store: Arc<dyn Store>,
    pub llm: Arc<dyn LlmClient>,
    pub tools: Arc<ToolRegistry>,
}

impl Runtime {
    pub fn new(config: AppConfig, store: Arc<dyn Store>, llm: Arc<dyn LlmClient>, tools: Arc<ToolRegistry>) -> Self {
        Self { config, store, llm, tools }
    }

    /// Runs one turn with no event sink and no cancellation — the shape the
    /// trigger-run executor invokes.
    pub async fn run_turn_silent(&self, request: TurnRequest) -> Result<TurnResult> {
        self.run_turn(request, &NullSink, &CancellationToken::new()).await
    }

    #[instrument(skip(self, request, sink, cancel), fields(model = request.model.as_deref().unwrap_or("default")))]
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<TurnResult> {
        let trimmed = request.message.trim();
        if trimmed.is_empty() {
            return Err(RuntimeError::BadRequest("message must not be empty".to_string()));
        }

        // Step 1: pick the model.
        let model = self.config.resolve_model(request.model.as_deref());

        // Step 2: resolve the conversation.
        let conversation: Conversation = self
            .store
            .upsert_conversation(request.conversation_id.as_deref(), &model)
            .await?;
        sink.on_conversation(&conversation.id);

        // Step 3: append the user message.
        let user_message = self
            .store
            .add_message(
                &conversation.id,
                Role::User,
                trimmed,
                shrimp_store::AddMessageOptions {
                    reply_to_message_id: request.reply_to_message_id.clone(),
                    bubble_group_id: None,
                    attachments: request.attachments.clone(),
                },
            )
            .await?;
        let mut message_ids = vec![user_message.id.clone()];

        // Step 4: default-title rename.
        if conversation.title == DEFAULT_CONVERSATION_TITLE {
            let title = truncate_title(trimmed, DEFAULT_TITLE_CHARS);
            self.store.set_conversation_title_if_default(&conversation.id, &title).await?;
        }

        // Step 5: build history from everything persisted so far.
        let persisted = self.store.list_messages(&conversation.id).await?;
        let mut working_messages = build_history(&persisted);

        // Step 6: prepend the system prompt.
        let memory_items = self.current_memory_items().await;
        let system_prompt = shrimp_prompt::build_system_prompt(&memory_items);
        working_messages.insert(0, ChatMessage::system(system_prompt));

        let tools_json = self.tools.tools_json();
        let tools_decl = if tools_json.as_array().is_some_and(|a| !a.is_empty()) {
            Some(tools_json)
        } else {
            None
        };

        // Step 7: bounded tool-call loop.
        let mut final_assistant_text = String::new();
        for iteration in 0..MAX_TOOL_ITERATIONS {
            if cancel.is_cancelled() {
                debug!(iteration, "turn cancelled between rounds");
                break;
            }

            let response = self.llm.complete(&model, &working_messages, tools_decl.as_ref()).await?;

            let content = response.content.as_deref().map(strip_think_tags).unwrap_or_default();
            if response.tool_calls.is_empty() {
                final_assistant_text.push_str(&content);
                break;
            }

            working_messages.push(ChatMessage::assistant_tool_calls(
                if content.is_empty() { None } else { Some(content.clone()) },
                response.tool_calls.clone(),
            ));
            if !content.is_empty() {
                final_assistant_text.push_str(&content);
            }

            for tool_call in &response.tool_calls {
                self.run_one_tool_call(&conversation.id, tool_call, &mut working_messages, sink).await?;
            }

            info!(iteration, tool_calls = response.tool_calls.len(), "tool round completed");
        }

        // Step 8: split into bubbles and stream.
        let mut bubbles = split_into_bubbles(&final_assistant_text);
        if bubbles.is_empty() {
            bubbles.push("Done.".to_string());
        }

        let bubble_group_id = Uuid::new_v4().to_string();
        for (index, bubble) in bubbles.iter().enumerate() {
            let persisted_bubble = self
                .store
                .add_message(
                    &conversation.id,
                    Role::Assistant,
                    bubble,
                    shrimp_store::AddMessageOptions {
                        reply_to_message_id: None,
                        bubble_group_id: Some(bubble_group_id.clone()),
                        attachments: vec![],
                    },
                )
                .await?;
            message_ids.push(persisted_bubble.id.clone());

            sink.on_assistant_bubble_start(&persisted_bubble.id);
            stream_bubble_tokens(bubble, &persisted_bubble.id, sink).await;

            if index + 1 < bubbles.len() {
                tokio::time::sleep(INTER_BUBBLE_DELAY).await;
            }
        }
        sink.on_assistant_done();

        Ok(TurnResult { conversation_id: conversation.id, message_ids, bubbles })
    }

    async fn run_one_tool_call(
        &self,
        conversation_id: &str,
        tool_call: &shrimp_llm::ToolCall,
        working_messages: &mut Vec<ChatMessage>,
        sink: &dyn EventSink,
    ) -> Result<()> {
        let record = self
            .store
            .add_tool_call(conversation_id, &tool_call.function.name, tool_call.function.arguments.clone())
            .await?;
        sink.on_tool_call_started(&record.id, &tool_call.function.name, &tool_call.function.arguments);

        let output = self.tools.dispatch(&tool_call.function.name, tool_call.function.arguments.clone()).await;

        self.store.complete_tool_call(&record.id, output.success, output.output.clone()).await?;
        sink.on_tool_call_output(&record.id, &preview(&output.output, TOOL_OUTPUT_PREVIEW_CHARS));
        sink.on_tool_call_finished(&record.id, output.success, &output.output);

        working_messages.push(ChatMessage::tool_result(tool_call.id.clone(), output.output.to_string()));
        Ok(())
    }

    async fn current_memory_items(&self) -> Vec<String> {
        let result = self.tools.dispatch("list_system_prompt_memory", json!({})).await;
        if !result.success {
            warn!("failed to read persistent memory for system prompt");
            return Vec::new();
        }
        result
            .output
            .get("items")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    }
}

/// Resolves (or creates) the conversation a channel update should land in,
/// for front-channel adapters (Telegram, …) ahead of calling
/// [`Runtime::run_turn`].
pub async fn resolve_channel_conversation(
    store: &dyn Store,
    channel: Channel,
    external_chat_id: &str,
    default_model: &str,
) -> Result<Conversation> {
    Ok(store.get_or_create_channel_conversation(channel, external_chat_id, default_model).await?)
}

async fn stream_bubble_tokens(bubble: &str, bubble_id: &str, sink: &dyn EventSink) {
    let chars: Vec<char> = bubble.chars().collect();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + TOKEN_CHUNK_CHARS).min(chars.len());
        let chunk: String = chars[start..end].iter().collect();
        sink.on_assistant_token(bubble_id, &chunk);
        start = end;
        if start < chars.len() {
            tokio::time::sleep(TOKEN_CHUNK_DELAY).await;
        }
    }
}

fn preview(value: &Value, max_chars: usize) -> String {
    let rendered = value.to_string();
    let chars: Vec<char> = rendered.chars().collect();
    if chars.len() <= max_chars {
        rendered
    } else {
        chars[..max_chars].iter().collect()
    }
}

fn truncate_title(message: &str, max_chars: usize) -> String {
    let collapsed = message.split_whitespace().collect::<Vec<_>>().join(" ");
    let chars: Vec<char> = collapsed.chars().collect();
    if chars.len() <= max_chars {
        collapsed
    } else {
        chars[..max_chars].iter().collect()
    }
}

/// Strips `<think>...</think>` blocks and any stray opening/closing tag.
fn strip_think_tags(content: &str) -> String {
    let block = Regex::new(r"(?s)<think>.*?</think>").expect("valid think-block regex");
    let without_blocks = block.replace_all(content, "");
    let stray = Regex::new(r"</?think>").expect("valid stray-think-tag regex");
    stray.replace_all(&without_blocks, "").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_complete_think_block() {
        let content = "before<think>internal reasoning</think>after";
        assert_eq!(strip_think_tags(content), "beforeafter");
    }

    #[test]
    fn strips_stray_tags_with_no_matching_pair() {
        let content = "reply</think> continues <think>more";
        assert_eq!(strip_think_tags(content), "reply continues more");
    }

    #[test]
    fn truncate_title_collapses_whitespace_and_caps_length() {
        let message = "  this   is   a very long first message that should be cut off eventually  ";
        let title = truncate_title(message, 20);
        assert_eq!(title.chars().count(), 20);
        assert_eq!(title, "this is a very long ");
    }
}
