//! Builds the working message list the LLM sees from a conversation's
//! persisted messages.

use std::collections::HashMap;

use shrimp_llm::ChatMessage;
use shrimp_store::{AttachmentKind, Message, Role};

const REPLY_PREVIEW_CHARS: usize = 180;
const TEXT_ATTACHMENT_EXCERPT_CHARS: usize = 5_000;

/// Collapses whitespace and truncates to `max_chars`, matching the preview
/// used for a replied-to message's quoted context.
fn compact_preview(content: &str, max_chars: usize) -> String {
    let collapsed = content.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&collapsed, max_chars)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        text.to_string()
    } else {
        chars[..max_chars].iter().collect()
    }
}

fn attachments_block(message: &Message) -> String {
    if message.attachments.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = message
        .attachments
        .iter()
        .map(|a| match a.kind {
            AttachmentKind::Image => format!("- {}: image file attached by user", a.display_name),
            AttachmentKind::Text => {
                let excerpt = a
                    .text_excerpt
                    .as_deref()
                    .map(|t| truncate_chars(t, TEXT_ATTACHMENT_EXCERPT_CHARS))
                    .unwrap_or_default();
                format!("- {}: {}", a.display_name, excerpt)
            }
            AttachmentKind::Binary => format!("- {}: binary file attached by user", a.display_name),
        })
        .collect();
    format!("\n\n[Attachments]\n{}", lines.join("\n"))
}

/// Renders one persisted message into the content the LLM sees, rewriting
/// reply-to user messages with quoted context and appending an attachments
/// summary block.
fn render_content(message: &Message, by_id: &HashMap<&str, &Message>) -> String {
    let with_attachments = format!("{}{}", message.content, attachments_block(message));

    match (&message.role, &message.reply_to_message_id) {
        (Role::User, Some(reply_to)) => {
            let preview = by_id
                .get(reply_to.as_str())
                .map(|replied| compact_preview(&replied.content, REPLY_PREVIEW_CHARS))
                .unwrap_or_default();
            format!("Context from replied message: \"{preview}\"\n\nUser reply: {with_attachments}")
        }
        _ => with_attachments,
    }
}

/// Builds the LLM-facing history (without the system prompt, prepended
/// separately) from every message persisted in the conversation so far, in
/// ascending creation order.
pub fn build_history(messages: &[Message]) -> Vec<ChatMessage> {
    let by_id: HashMap<&str, &Message> = messages.iter().map(|m| (m.id.as_str(), m)).collect();

    messages
        .iter()
        .map(|message| {
            let content = render_content(message, &by_id);
            match message.role {
                Role::User => ChatMessage::user(content),
                Role::Assistant => ChatMessage::assistant(content),
                Role::System => ChatMessage::system(content),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shrimp_store::Attachment;

    fn message(id: &str, role: Role, content: &str) -> Message {
        Message {
            id: id.to_string(),
            conversation_id: "conv".to_string(),
            role,
            content: content.to_string(),
            reply_to_message_id: None,
            bubble_group_id: None,
            attachments: vec![],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn plain_messages_map_straight_through() {
        let messages = vec![
            message("m1", Role::User, "hello"),
            message("m2", Role::Assistant, "hi there"),
        ];
        let history = build_history(&messages);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content.as_deref(), Some("hello"));
        assert_eq!(history[1].content.as_deref(), Some("hi there"));
    }

    #[test]
    fn reply_to_rewrites_content_with_quoted_context() {
        let original = message("m1", Role::Assistant, "the build is green");
        let mut reply = message("m2", Role::User, "great, ship it");
        reply.reply_to_message_id = Some("m1".to_string());
        let history = build_history(&[original, reply]);
        let rewritten = history[1].content.as_deref().unwrap();
        assert!(rewritten.starts_with("Context from replied message: \"the build is green\""));
        assert!(rewritten.contains("User reply: great, ship it"));
    }

    #[test]
    fn text_attachment_excerpt_is_appended() {
        let mut msg = message("m1", Role::User, "see attached");
        msg.attachments.push(Attachment {
            id: "a1".to_string(),
            display_name: "notes.txt".to_string(),
            mime_type: "text/plain".to_string(),
            byte_size: 5,
            kind: AttachmentKind::Text,
            data_url: None,
            text_excerpt: Some("line one".to_string()),
        });
        let history = build_history(&[msg]);
        let content = history[0].content.as_deref().unwrap();
        assert!(content.contains("[Attachments]"));
        assert!(content.contains("notes.txt: line one"));
    }

    #[test]
    fn image_attachment_is_noted_without_inline_data() {
        let mut msg = message("m1", Role::User, "see attached");
        msg.attachments.push(Attachment {
            id: "a1".to_string(),
            display_name: "photo.png".to_string(),
            mime_type: "image/png".to_string(),
            byte_size: 1000,
            kind: AttachmentKind::Image,
            data_url: Some("data:image/png;base64,...".to_string()),
            text_excerpt: None,
        });
        let history = build_history(&[msg]);
        let content = history[0].content.as_deref().unwrap();
        assert!(content.contains("photo.png: image file attached by user"));
        assert!(!content.contains("data:image"));
    }
}
