// Channel-neutral sessions
// A session is identified by (channel, external thread id), independent of
// the transport the message arrived on.

use serde::{Deserialize, Serialize};

/// Source channel of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Web,
    Telegram,
    Imessage,
    Webex,
    Email,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Telegram => "telegram",
            Self::Imessage => "imessage",
            Self::Webex => "webex",
            Self::Email => "email",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "web" => Self::Web,
            "telegram" => Self::Telegram,
            "imessage" => Self::Imessage,
            "webex" => Self::Webex,
            "email" => Self::Email,
            _ => return None,
        })
    }
}

/// Normalized inbound message from any channel adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub channel: ChannelKind,
    /// Stable thread identifier, opaque to the core
    pub external_thread_id: String,
    pub external_message_id: String,
    pub sender_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
}

/// A persistent, channel-neutral conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub channel: ChannelKind,
    pub external_thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_user_name: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Role of a stored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "user" => Self::User,
            "assistant" => Self::Assistant,
            "system" => Self::System,
            "tool" => Self::Tool,
            _ => return None,
        })
    }
}

/// A message persisted inside a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    /// Channel the message arrived on ("web" for internally generated ones)
    pub source_channel: ChannelKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub attachments: Vec<String>,
    /// True when the redaction pipeline altered the content
    pub redacted: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_kind_round_trips() {
        for kind in [
            ChannelKind::Web,
            ChannelKind::Telegram,
            ChannelKind::Imessage,
            ChannelKind::Webex,
            ChannelKind::Email,
        ] {
            assert_eq!(ChannelKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ChannelKind::parse("fax"), None);
    }

    #[test]
    fn envelope_serde() {
        let envelope = MessageEnvelope {
            channel: ChannelKind::Telegram,
            external_thread_id: "chat123".to_string(),
            external_message_id: "m1".to_string(),
            sender_id: "user1".to_string(),
            sender_name: Some("Test User".to_string()),
            text: "hello".to_string(),
            attachments: vec![],
        };
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"channel\":\"telegram\""));
        let back: MessageEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.external_thread_id, "chat123");
    }
}
