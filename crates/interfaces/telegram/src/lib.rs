//! The Telegram front channel: long-poll `getUpdates`, run one turn per
//! inbound text message, reply with each resulting bubble as its own
//! Telegram message.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use shrimp_runtime::{resolve_channel_conversation, Runtime, TurnRequest};
use shrimp_store::Channel;

/// Telegram's own message-length ceiling; chunks leave headroom for any
/// trailing truncation marker a caller might add.
const TELEGRAM_CHUNK_CHARS: usize = 3500;

pub async fn start_bot(runtime: Arc<Runtime>) -> Result<()> {
    let token = runtime
        .config
        .telegram
        .bot_token
        .clone()
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("TELEGRAM_BOT_TOKEN is not set"))?;

    let client = Client::new();
    let base_url = format!("https://api.telegram.org/bot{token}");
    let default_model = runtime.config.resolve_model(None);
    let mut offset: i64 = 0;

    tracing::info!("telegram front channel listening for updates");

    loop {
        let updates = match fetch_updates(&client, &base_url, offset).await {
            Ok(updates) => updates,
            Err(err) => {
                let message = err.to_string();
                if message.contains("409") {
                    tracing::warn!("telegram getUpdates 409 conflict: another poller is running, backing off");
                    tokio::time::sleep(Duration::from_secs(15)).await;
                } else {
                    tracing::warn!(error = %message, "telegram getUpdates failed, retrying");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                continue;
            }
        };

        for update in updates {
            offset = update.update_id + 1;

            let Some(message) = update.message else { continue };
            let Some(text) = message.text else { continue };
            let text = text.trim();
            if text.is_empty() {
                continue;
            }

            let chat_id = message.chat.id;
            let reply = match handle_message(&runtime, chat_id, text, &default_model).await {
                Ok(bubbles) => bubbles,
                Err(err) => {
                    tracing::warn!(chat_id, error = %err, "turn failed for telegram message");
                    vec![format!("error: {err}")]
                }
            };

            for bubble in reply {
                for chunk in chunk_message(&bubble, TELEGRAM_CHUNK_CHARS) {
                    if let Err(err) = send_message(&client, &base_url, chat_id, &chunk).await {
                        tracing::warn!(chat_id, error = %err, "telegram sendMessage failed");
                    }
                }
            }
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
    }
}

async fn handle_message(
    runtime: &Runtime,
    chat_id: i64,
    text: &str,
    default_model: &str,
) -> Result<Vec<String>> {
    let conversation =
        resolve_channel_conversation(runtime.store.as_ref(), Channel::Telegram, &chat_id.to_string(), default_model)
            .await?;

    let result = runtime
        .run_turn_silent(TurnRequest {
            conversation_id: Some(conversation.id),
            message: text.to_string(),
            ..Default::default()
        })
        .await?;

    Ok(result.bubbles)
}

async fn fetch_updates(client: &Client, base_url: &str, offset: i64) -> Result<Vec<TelegramUpdate>> {
    let url = format!("{base_url}/getUpdates");
    let response = client
        .get(url)
        .query(&[("timeout", "25"), ("offset", &offset.to_string())])
        .send()
        .await?
        .error_for_status()?;

    let payload: TelegramResponse<Vec<TelegramUpdate>> = response.json().await?;
    if !payload.ok {
        bail!(payload.description.unwrap_or_else(|| "telegram getUpdates failed".to_string()));
    }
    Ok(payload.result.unwrap_or_default())
}

async fn send_message(client: &Client, base_url: &str, chat_id: i64, text: &str) -> Result<()> {
    let url = format!("{base_url}/sendMessage");
    let body = SendMessageRequest { chat_id, text, disable_web_page_preview: true };

    let response = client.post(url).json(&body).send().await?.error_for_status()?;
    let payload: TelegramResponse<serde_json::Value> = response.json().await?;
    if !payload.ok {
        bail!(payload.description.unwrap_or_else(|| "telegram sendMessage failed".to_string()));
    }
    Ok(())
}

fn chunk_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for line in text.lines() {
        let line_len = line.chars().count() + 1;
        if current_len > 0 && current_len + line_len > max_chars {
            chunks.push(current.trim_end().to_string());
            current.clear();
            current_len = 0;
        }
        current.push_str(line);
        current.push('\n');
        current_len += line_len;
    }

    if !current.trim().is_empty() {
        chunks.push(current.trim_end().to_string());
    }
    if chunks.is_empty() {
        chunks.push(text.to_string());
    }
    chunks
}

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    chat: TelegramChat,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
    disable_web_page_preview: bool,
}

#[cfg(test)]
mod tests {
    use super::chunk_message;

    #[test]
    fn short_message_is_a_single_chunk() {
        assert_eq!(chunk_message("hello", 3500), vec!["hello".to_string()]);
    }

    #[test]
    fn long_message_splits_on_line_boundaries() {
        let text = format!("{}\n{}", "a".repeat(10), "b".repeat(10));
        let chunks = chunk_message(&text, 12);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(10));
        assert_eq!(chunks[1], "b".repeat(10));
    }
}
