//! Typed persistence interface over an embedded relational store. The core
//! (turn orchestrator, trigger-run executor) depends only on
//! the [`Store`] trait so tests can swap in a fake; [`sqlite::SqliteStore`] is
//! the production implementation, grounded on the sqlx + sqlite pattern used
//! elsewhere in this corpus (`db_client.rs`-style pool + migration-on-open).

mod error;
mod sqlite;
pub mod types;

pub use error::{Result, StorageError};
pub use sqlite::SqliteStore;
pub use types::*;

use async_trait::async_trait;

/// Typed CRUD over conversations, messages, tool-calls, channel-links, and
/// trigger-runs. Every operation either returns the produced entity (or
/// `None`/`Vec` as appropriate) or fails with [`StorageError`].
#[async_trait]
pub trait Store: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<Conversation>>;
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>>;
    async fn create_conversation(&self, model: &str, title: &str) -> Result<Conversation>;

    /// Creates a conversation if `id` is `None` or does not exist; otherwise
    /// bumps `model` and `updated_at` on the existing row.
    async fn upsert_conversation(&self, id: Option<&str>, model: &str) -> Result<Conversation>;

    async fn rename_conversation(&self, id: &str, title: &str) -> Result<Option<Conversation>>;

    /// Renames only if the current title is still [`DEFAULT_CONVERSATION_TITLE`].
    async fn set_conversation_title_if_default(
        &self,
        id: &str,
        title: &str,
    ) -> Result<Option<Conversation>>;

    /// Atomic cascade: also removes messages, tool-calls, and channel-links.
    async fn delete_conversation(&self, id: &str) -> Result<bool>;

    async fn add_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        opts: AddMessageOptions,
    ) -> Result<Message>;

    /// Ascending by creation timestamp.
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>>;

    async fn update_message_content(&self, id: &str, content: &str) -> Result<Option<Message>>;
    async fn delete_message(&self, id: &str) -> Result<bool>;

    async fn add_tool_call(
        &self,
        conversation_id: &str,
        tool_name: &str,
        args: serde_json::Value,
    ) -> Result<ToolCallRecord>;

    /// Transitions a tool call to its terminal state exactly once.
    async fn complete_tool_call(
        &self,
        id: &str,
        ok: bool,
        output: serde_json::Value,
    ) -> Result<Option<ToolCallRecord>>;

    async fn list_tool_calls(&self, conversation_id: &str) -> Result<Vec<ToolCallRecord>>;

    /// Creates the conversation on first inbound message from `(channel,
    /// external_chat_id)`; reuses it on subsequent messages.
    async fn get_or_create_channel_conversation(
        &self,
        channel: Channel,
        external_chat_id: &str,
        model: &str,
    ) -> Result<Conversation>;

    async fn create_trigger_run(
        &self,
        trigger_kind: TriggerKind,
        instruction: &str,
        model: Option<&str>,
        payload: Option<serde_json::Value>,
    ) -> Result<TriggerRun>;

    async fn complete_trigger_run(
        &self,
        id: &str,
        ok: bool,
        output: serde_json::Value,
        final_result: Option<&str>,
    ) -> Result<Option<TriggerRun>>;

    async fn set_trigger_run_conversation_id(
        &self,
        id: &str,
        conversation_id: &str,
    ) -> Result<Option<TriggerRun>>;

    async fn list_trigger_runs(&self, limit: u32) -> Result<Vec<TriggerRun>>;
    async fn get_trigger_run(&self, id: &str) -> Result<Option<TriggerRun>>;
}
