use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{Result, StorageError};
use crate::types::*;
use crate::Store;

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS conversations (
    id         TEXT PRIMARY KEY,
    title      TEXT NOT NULL,
    model      TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id                  TEXT PRIMARY KEY,
    conversation_id     TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    role                TEXT NOT NULL,
    content             TEXT NOT NULL,
    reply_to_message_id TEXT,
    bubble_group_id     TEXT,
    attachments_json     TEXT,
    created_at          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages(conversation_id, created_at ASC);

CREATE TABLE IF NOT EXISTS tool_calls (
    id              TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    tool_name       TEXT NOT NULL,
    args_json       TEXT NOT NULL,
    status          TEXT NOT NULL,
    result_json     TEXT,
    created_at      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tool_calls_conversation
    ON tool_calls(conversation_id, created_at ASC);

CREATE TABLE IF NOT EXISTS channel_links (
    channel          TEXT NOT NULL,
    external_chat_id TEXT NOT NULL,
    conversation_id  TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    PRIMARY KEY (channel, external_chat_id)
);

CREATE TABLE IF NOT EXISTS trigger_runs (
    id              TEXT PRIMARY KEY,
    trigger_kind    TEXT NOT NULL,
    instruction     TEXT NOT NULL,
    model           TEXT,
    payload_json    TEXT,
    status          TEXT NOT NULL,
    output_json     TEXT,
    final_result    TEXT,
    error           TEXT,
    conversation_id TEXT REFERENCES conversations(id) ON DELETE SET NULL,
    created_at      TEXT NOT NULL,
    finished_at     TEXT
);
"#;

/// sqlite-backed [`Store`]. Single-writer, single-user local store — the pool
/// is capped small since sqlite itself serializes writes.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if absent) the sqlite file at `path`, running the
    /// idempotent schema migration. Use `"sqlite::memory:"` in tests.
    pub async fn connect(path: &str) -> Result<Self> {
        let options = if path == "sqlite::memory:" || path == ":memory:" {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StorageError::Invalid(format!("creating db directory: {e}"))
                    })?;
                }
            }
            SqliteConnectOptions::from_str(&format!("sqlite://{path}"))?.create_if_missing(true)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(SCHEMA).execute(&pool).await?;

        Ok(Self { pool })
    }

    fn new_id() -> String {
        Uuid::new_v4().to_string()
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Invalid(format!("bad timestamp {s}: {e}")))
}

fn row_to_conversation(row: &sqlx::sqlite::SqliteRow) -> Result<Conversation> {
    Ok(Conversation {
        id: row.try_get("id")?,
        title: row.try_get("title")?,
        model: row.try_get("model")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_ts(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<Message> {
    let role_str: String = row.try_get("role")?;
    let attachments_json: Option<String> = row.try_get("attachments_json")?;
    let attachments = match attachments_json {
        Some(json) if !json.is_empty() => serde_json::from_str(&json)
            .map_err(|e| StorageError::Invalid(format!("bad attachments json: {e}")))?,
        _ => Vec::new(),
    };
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        role: Role::from_str(&role_str).map_err(StorageError::Invalid)?,
        content: row.try_get("content")?,
        reply_to_message_id: row.try_get("reply_to_message_id")?,
        bubble_group_id: row.try_get("bubble_group_id")?,
        attachments,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn row_to_tool_call(row: &sqlx::sqlite::SqliteRow) -> Result<ToolCallRecord> {
    let status_str: String = row.try_get("status")?;
    let args_json: String = row.try_get("args_json")?;
    let result_json: Option<String> = row.try_get("result_json")?;
    Ok(ToolCallRecord {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        tool_name: row.try_get("tool_name")?,
        args: serde_json::from_str(&args_json)
            .map_err(|e| StorageError::Invalid(format!("bad args json: {e}")))?,
        status: ToolCallStatus::from_str(&status_str).map_err(StorageError::Invalid)?,
        result: result_json
            .map(|j| serde_json::from_str(&j))
            .transpose()
            .map_err(|e| StorageError::Invalid(format!("bad result json: {e}")))?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn row_to_trigger_run(row: &sqlx::sqlite::SqliteRow) -> Result<TriggerRun> {
    let trigger_kind: String = row.try_get("trigger_kind")?;
    let status: String = row.try_get("status")?;
    let payload_json: Option<String> = row.try_get("payload_json")?;
    let output_json: Option<String> = row.try_get("output_json")?;
    let finished_at: Option<String> = row.try_get("finished_at")?;
    Ok(TriggerRun {
        id: row.try_get("id")?,
        trigger_kind: TriggerKind::from_str(&trigger_kind).map_err(StorageError::Invalid)?,
        instruction: row.try_get("instruction")?,
        model: row.try_get("model")?,
        payload: payload_json
            .map(|j| serde_json::from_str(&j))
            .transpose()
            .map_err(|e| StorageError::Invalid(format!("bad payload json: {e}")))?,
        status: TriggerStatus::from_str(&status).map_err(StorageError::Invalid)?,
        output: output_json
            .map(|j| serde_json::from_str(&j))
            .transpose()
            .map_err(|e| StorageError::Invalid(format!("bad output json: {e}")))?,
        final_result: row.try_get("final_result")?,
        error: row.try_get("error")?,
        conversation_id: row.try_get("conversation_id")?,
        created_at: parse_ts(&row.try_get::<String, _>("created_at")?)?,
        finished_at: finished_at.map(|s| parse_ts(&s)).transpose()?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let rows = sqlx::query("SELECT * FROM conversations ORDER BY updated_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_conversation).collect()
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query("SELECT * FROM conversations WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_conversation).transpose()
    }

    async fn create_conversation(&self, model: &str, title: &str) -> Result<Conversation> {
        let id = Self::new_id();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO conversations (id, title, model, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
        )
        .bind(&id)
        .bind(title)
        .bind(model)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(Conversation {
            id,
            title: title.to_string(),
            model: model.to_string(),
            created_at: now,
            updated_at: now,
        })
    }

    async fn upsert_conversation(&self, id: Option<&str>, model: &str) -> Result<Conversation> {
        if let Some(id) = id {
            if let Some(existing) = self.get_conversation(id).await? {
                let now = Utc::now();
                sqlx::query("UPDATE conversations SET model = ?1, updated_at = ?2 WHERE id = ?3")
                    .bind(model)
                    .bind(now.to_rfc3339())
                    .bind(id)
                    .execute(&self.pool)
                    .await?;
                return Ok(Conversation {
                    model: model.to_string(),
                    updated_at: now,
                    ..existing
                });
            }
        }
        self.create_conversation(model, DEFAULT_CONVERSATION_TITLE)
            .await
    }

    async fn rename_conversation(&self, id: &str, title: &str) -> Result<Option<Conversation>> {
        let now = Utc::now();
        let result = sqlx::query("UPDATE conversations SET title = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(title)
            .bind(now.to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_conversation(id).await
    }

    async fn set_conversation_title_if_default(
        &self,
        id: &str,
        title: &str,
    ) -> Result<Option<Conversation>> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE conversations SET title = ?1, updated_at = ?2
             WHERE id = ?3 AND title = ?4",
        )
        .bind(title)
        .bind(now.to_rfc3339())
        .bind(id)
        .bind(DEFAULT_CONVERSATION_TITLE)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return self.get_conversation(id).await;
        }
        self.get_conversation(id).await
    }

    async fn delete_conversation(&self, id: &str) -> Result<bool> {
        // children cascade via ON DELETE CASCADE / SET NULL
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        opts: AddMessageOptions,
    ) -> Result<Message> {
        let id = Self::new_id();
        let now = Utc::now();
        let attachments_json = if opts.attachments.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(&opts.attachments)
                    .map_err(|e| StorageError::Invalid(format!("serializing attachments: {e}")))?,
            )
        };

        sqlx::query(
            "INSERT INTO messages
                (id, conversation_id, role, content, reply_to_message_id, bubble_group_id, attachments_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(role.as_str())
        .bind(content)
        .bind(&opts.reply_to_message_id)
        .bind(&opts.bubble_group_id)
        .bind(&attachments_json)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        sqlx::query("UPDATE conversations SET updated_at = ?1 WHERE id = ?2")
            .bind(now.to_rfc3339())
            .bind(conversation_id)
            .execute(&self.pool)
            .await?;

        Ok(Message {
            id,
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            reply_to_message_id: opts.reply_to_message_id,
            bubble_group_id: opts.bubble_group_id,
            attachments: opts.attachments,
            created_at: now,
        })
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            "SELECT * FROM messages WHERE conversation_id = ?1 ORDER BY created_at ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_message).collect()
    }

    async fn update_message_content(&self, id: &str, content: &str) -> Result<Option<Message>> {
        let result = sqlx::query("UPDATE messages SET content = ?1 WHERE id = ?2")
            .bind(content)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_message).transpose()
    }

    async fn delete_message(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM messages WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_tool_call(
        &self,
        conversation_id: &str,
        tool_name: &str,
        args: serde_json::Value,
    ) -> Result<ToolCallRecord> {
        let id = Self::new_id();
        let now = Utc::now();
        let args_json = serde_json::to_string(&args)
            .map_err(|e| StorageError::Invalid(format!("serializing args: {e}")))?;

        sqlx::query(
            "INSERT INTO tool_calls (id, conversation_id, tool_name, args_json, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(tool_name)
        .bind(&args_json)
        .bind(ToolCallStatus::Running.as_str())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(ToolCallRecord {
            id,
            conversation_id: conversation_id.to_string(),
            tool_name: tool_name.to_string(),
            args,
            status: ToolCallStatus::Running,
            result: None,
            created_at: now,
        })
    }

    async fn complete_tool_call(
        &self,
        id: &str,
        ok: bool,
        output: serde_json::Value,
    ) -> Result<Option<ToolCallRecord>> {
        let status = if ok {
            ToolCallStatus::Success
        } else {
            ToolCallStatus::Error
        };
        let result_json = serde_json::to_string(&output)
            .map_err(|e| StorageError::Invalid(format!("serializing result: {e}")))?;

        let result = sqlx::query(
            "UPDATE tool_calls SET status = ?1, result_json = ?2
             WHERE id = ?3 AND status = ?4",
        )
        .bind(status.as_str())
        .bind(&result_json)
        .bind(id)
        .bind(ToolCallStatus::Running.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        let row = sqlx::query("SELECT * FROM tool_calls WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_tool_call).transpose()
    }

    async fn list_tool_calls(&self, conversation_id: &str) -> Result<Vec<ToolCallRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM tool_calls WHERE conversation_id = ?1 ORDER BY created_at ASC",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_tool_call).collect()
    }

    async fn get_or_create_channel_conversation(
        &self,
        channel: Channel,
        external_chat_id: &str,
        model: &str,
    ) -> Result<Conversation> {
        let row = sqlx::query(
            "SELECT conversation_id FROM channel_links WHERE channel = ?1 AND external_chat_id = ?2",
        )
        .bind(channel.as_str())
        .bind(external_chat_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            let conversation_id: String = row.try_get("conversation_id")?;
            if let Some(conversation) = self.get_conversation(&conversation_id).await? {
                return Ok(conversation);
            }
        }

        let conversation = self.create_conversation(model, DEFAULT_CONVERSATION_TITLE).await?;
        sqlx::query(
            "INSERT INTO channel_links (channel, external_chat_id, conversation_id)
             VALUES (?1, ?2, ?3)",
        )
        .bind(channel.as_str())
        .bind(external_chat_id)
        .bind(&conversation.id)
        .execute(&self.pool)
        .await?;

        Ok(conversation)
    }

    async fn create_trigger_run(
        &self,
        trigger_kind: TriggerKind,
        instruction: &str,
        model: Option<&str>,
        payload: Option<serde_json::Value>,
    ) -> Result<TriggerRun> {
        let id = Self::new_id();
        let now = Utc::now();
        let payload_json = payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StorageError::Invalid(format!("serializing payload: {e}")))?;

        sqlx::query(
            "INSERT INTO trigger_runs
                (id, trigger_kind, instruction, model, payload_json, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&id)
        .bind(trigger_kind.as_str())
        .bind(instruction)
        .bind(model)
        .bind(&payload_json)
        .bind(TriggerStatus::Running.as_str())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(TriggerRun {
            id,
            trigger_kind,
            instruction: instruction.to_string(),
            model: model.map(|s| s.to_string()),
            payload,
            status: TriggerStatus::Running,
            output: None,
            final_result: None,
            error: None,
            conversation_id: None,
            created_at: now,
            finished_at: None,
        })
    }

    async fn complete_trigger_run(
        &self,
        id: &str,
        ok: bool,
        output: serde_json::Value,
        final_result: Option<&str>,
    ) -> Result<Option<TriggerRun>> {
        let status = if ok {
            TriggerStatus::Success
        } else {
            TriggerStatus::Error
        };
        let now = Utc::now();
        let output_json = serde_json::to_string(&output)
            .map_err(|e| StorageError::Invalid(format!("serializing output: {e}")))?;
        let error = if ok {
            None
        } else {
            output
                .get("error")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };

        let result = sqlx::query(
            "UPDATE trigger_runs SET status = ?1, output_json = ?2, final_result = ?3,
                error = ?4, finished_at = ?5
             WHERE id = ?6",
        )
        .bind(status.as_str())
        .bind(&output_json)
        .bind(final_result)
        .bind(&error)
        .bind(now.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_trigger_run(id).await
    }

    async fn set_trigger_run_conversation_id(
        &self,
        id: &str,
        conversation_id: &str,
    ) -> Result<Option<TriggerRun>> {
        let result = sqlx::query("UPDATE trigger_runs SET conversation_id = ?1 WHERE id = ?2")
            .bind(conversation_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_trigger_run(id).await
    }

    async fn list_trigger_runs(&self, limit: u32) -> Result<Vec<TriggerRun>> {
        let rows = sqlx::query("SELECT * FROM trigger_runs ORDER BY created_at DESC LIMIT ?1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_trigger_run).collect()
    }

    async fn get_trigger_run(&self, id: &str) -> Result<Option<TriggerRun>> {
        let row = sqlx::query("SELECT * FROM trigger_runs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_trigger_run).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn mem_store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn upsert_unknown_id_creates_new_conversation() {
        let store = mem_store().await;
        let conv = store.upsert_conversation(Some("nope"), "gpt-4.1-mini").await.unwrap();
        assert_ne!(conv.id, "nope");
        assert_eq!(conv.title, DEFAULT_CONVERSATION_TITLE);
    }

    #[tokio::test]
    async fn upsert_known_id_bumps_model() {
        let store = mem_store().await;
        let conv = store.create_conversation("gpt-4.1-mini", "New chat").await.unwrap();
        let updated = store.upsert_conversation(Some(&conv.id), "gpt-4o").await.unwrap();
        assert_eq!(updated.id, conv.id);
        assert_eq!(updated.model, "gpt-4o");
    }

    #[tokio::test]
    async fn messages_listed_in_append_order() {
        let store = mem_store().await;
        let conv = store.create_conversation("gpt-4.1-mini", "New chat").await.unwrap();
        for i in 0..5 {
            store
                .add_message(&conv.id, Role::User, &format!("msg {i}"), Default::default())
                .await
                .unwrap();
        }
        let messages = store.list_messages(&conv.id).await.unwrap();
        let contents: Vec<_> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["msg 0", "msg 1", "msg 2", "msg 3", "msg 4"]);
    }

    #[tokio::test]
    async fn tool_call_reaches_terminal_state_once() {
        let store = mem_store().await;
        let conv = store.create_conversation("gpt-4.1-mini", "New chat").await.unwrap();
        let call = store
            .add_tool_call(&conv.id, "read_file", serde_json::json!({"path": "a.txt"}))
            .await
            .unwrap();
        assert_eq!(call.status, ToolCallStatus::Running);

        let completed = store
            .complete_tool_call(&call.id, true, serde_json::json!({"content": "hi"}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completed.status, ToolCallStatus::Success);

        // Second completion is a no-op (already terminal).
        let second = store
            .complete_tool_call(&call.id, false, serde_json::json!({"error": "late"}))
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn delete_conversation_cascades() {
        let store = mem_store().await;
        let conv = store.create_conversation("gpt-4.1-mini", "New chat").await.unwrap();
        store
            .add_message(&conv.id, Role::User, "hi", Default::default())
            .await
            .unwrap();
        store
            .add_tool_call(&conv.id, "read_file", serde_json::json!({}))
            .await
            .unwrap();

        assert!(store.delete_conversation(&conv.id).await.unwrap());
        assert!(store.list_messages(&conv.id).await.unwrap().is_empty());
        assert!(store.list_tool_calls(&conv.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn channel_link_reused_across_messages() {
        let store = mem_store().await;
        let first = store
            .get_or_create_channel_conversation(Channel::Telegram, "123", "gpt-4.1-mini")
            .await
            .unwrap();
        let second = store
            .get_or_create_channel_conversation(Channel::Telegram, "123", "gpt-4.1-mini")
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn set_title_if_default_only_applies_once() {
        let store = mem_store().await;
        let conv = store.create_conversation("gpt-4.1-mini", "New chat").await.unwrap();
        let renamed = store
            .set_conversation_title_if_default(&conv.id, "first message preview")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(renamed.title, "first message preview");

        // Title is no longer the default, so a second call is a no-op.
        let unaffected = store
            .set_conversation_title_if_default(&conv.id, "something else")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(unaffected.title, "first message preview");
    }
}
