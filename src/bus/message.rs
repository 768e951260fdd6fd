//! Message types carried by the bus.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reserved outbound content asking a channel to poll immediately.
pub const CHECK_COMMAND: &str = "CMD:CHECK";

/// An opaque blob attached to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

/// A message produced by a channel for the agent loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: Uuid,
    /// Name of the channel the message arrived on.
    pub source_channel: String,
    pub sender_id: String,
    /// Where replies should go, interpreted by the source channel.
    pub chat_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(
        source_channel: impl Into<String>,
        sender_id: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_channel: source_channel.into(),
            sender_id: sender_id.into(),
            chat_id: chat_id.into(),
            content: content.into(),
            attachments: Vec::new(),
            metadata: BTreeMap::new(),
            received_at: Utc::now(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A message addressed to a channel by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub target_channel: String,
    pub chat_id: String,
    pub content: String,
}

impl OutboundMessage {
    pub fn new(
        target_channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            target_channel: target_channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
        }
    }

    /// Build a "poll now" command for the named channel.
    pub fn check(target_channel: impl Into<String>) -> Self {
        Self::new(target_channel, "", CHECK_COMMAND)
    }

    /// Whether the content is the reserved check command.
    pub fn is_check_command(&self) -> bool {
        self.content.trim() == CHECK_COMMAND
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_command_is_recognized_with_whitespace() {
        assert!(OutboundMessage::check("email").is_check_command());
        assert!(OutboundMessage::new("email", "x", "  CMD:CHECK\n").is_check_command());
        assert!(!OutboundMessage::new("email", "x", "cmd:check").is_check_command());
        assert!(!OutboundMessage::new("email", "x", "CMD:CHECK please").is_check_command());
    }

    #[test]
    fn inbound_builder_sets_fields() {
        let mut meta = BTreeMap::new();
        meta.insert("subject".to_string(), "Hi".to_string());
        let msg = InboundMessage::new("email", "a@x.com", "a@x.com", "body").with_metadata(meta);
        assert_eq!(msg.source_channel, "email");
        assert_eq!(msg.chat_id, "a@x.com");
        assert_eq!(msg.metadata.get("subject").map(String::as_str), Some("Hi"));
        assert!(msg.attachments.is_empty());
    }

    #[test]
    fn inbound_serializes_without_empty_attachments() {
        let msg = InboundMessage::new("cli", "local-user", "local-user", "hello");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("\"attachments\""));
        let parsed: InboundMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, msg.id);
    }
}
