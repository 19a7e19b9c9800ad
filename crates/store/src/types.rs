//! Entity types for the persistence interface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Text,
    Binary,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::Text => "text",
            AttachmentKind::Binary => "binary",
        }
    }
}

impl std::str::FromStr for AttachmentKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(AttachmentKind::Image),
            "text" => Ok(AttachmentKind::Text),
            "binary" => Ok(AttachmentKind::Binary),
            other => Err(format!("unknown attachment kind: {other}")),
        }
    }
}

/// Immutable once attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub display_name: String,
    pub mime_type: String,
    pub byte_size: u64,
    pub kind: AttachmentKind,
    /// Populated only when `kind == Image`.
    pub data_url: Option<String>,
    /// Populated only when `kind == Text`.
    pub text_excerpt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const DEFAULT_CONVERSATION_TITLE: &str = "New chat";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub reply_to_message_id: Option<String>,
    pub bubble_group_id: Option<String>,
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
}

/// Options accepted by `Store::add_message`.
#[derive(Debug, Clone, Default)]
pub struct AddMessageOptions {
    pub reply_to_message_id: Option<String>,
    pub bubble_group_id: Option<String>,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Running,
    Success,
    Error,
}

impl ToolCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCallStatus::Running => "running",
            ToolCallStatus::Success => "success",
            ToolCallStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for ToolCallStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ToolCallStatus::Running),
            "success" => Ok(ToolCallStatus::Success),
            "error" => Ok(ToolCallStatus::Error),
            other => Err(format!("unknown tool call status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub conversation_id: String,
    pub tool_name: String,
    pub args: serde_json::Value,
    pub status: ToolCallStatus,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Telegram,
    Whatsapp,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Telegram => "telegram",
            Channel::Whatsapp => "whatsapp",
        }
    }
}

impl std::str::FromStr for Channel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "telegram" => Ok(Channel::Telegram),
            "whatsapp" => Ok(Channel::Whatsapp),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelLink {
    pub channel: Channel,
    pub external_chat_id: String,
    pub conversation_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Manual,
    Api,
    Webhook,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Manual => "manual",
            TriggerKind::Api => "api",
            TriggerKind::Webhook => "webhook",
        }
    }
}

impl std::str::FromStr for TriggerKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TriggerKind::Manual),
            "api" => Ok(TriggerKind::Api),
            "webhook" => Ok(TriggerKind::Webhook),
            other => Err(format!("unknown trigger kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerStatus {
    Running,
    Success,
    Error,
}

impl TriggerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerStatus::Running => "running",
            TriggerStatus::Success => "success",
            TriggerStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for TriggerStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(TriggerStatus::Running),
            "success" => Ok(TriggerStatus::Success),
            "error" => Ok(TriggerStatus::Error),
            other => Err(format!("unknown trigger status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerRun {
    pub id: String,
    pub trigger_kind: TriggerKind,
    pub instruction: String,
    pub model: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub status: TriggerStatus,
    pub output: Option<serde_json::Value>,
    pub final_result: Option<String>,
    pub error: Option<String>,
    pub conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
