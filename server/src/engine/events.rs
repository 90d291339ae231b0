use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::validation::ProtocolError;

/// Unique identifier for a message.
pub type MessageId = Uuid;

/// Unique identifier for a connected session (one per connection, not per user).
pub type SessionId = Uuid;

/// A chat message as persisted and as written to clients.
/// Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    /// Display name of the author.
    pub user: String,
    pub msg: String,
    pub channel: String,
    pub time: DateTime<Utc>,
}

impl ChatMessage {
    /// Create a message with a fresh id, stamped now.
    pub fn new(user: &str, channel: &str, msg: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            user: user.to_string(),
            msg,
            channel: channel.to_string(),
            time: Utc::now(),
        }
    }
}

/// Control objects written to clients alongside chat messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    /// Acknowledges the session's own join.
    Joined { channel: String, user: String },
    /// Acknowledges the session's own leave.
    Leave { channel: String, user: String },
    /// Membership notice fanned out to the other members of a channel.
    System { channel: String, text: String },
}

impl ControlEvent {
    pub fn user_joined(channel: &str, user: &str) -> Self {
        Self::System {
            channel: channel.to_string(),
            text: format!("{user} joined"),
        }
    }

    pub fn user_left(channel: &str, user: &str) -> Self {
        Self::System {
            channel: channel.to_string(),
            text: format!("{user} left"),
        }
    }
}

/// Anything that can sit in a session's mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Outbound {
    Control(ControlEvent),
    Chat(ChatMessage),
}

impl Outbound {
    /// The id of the wrapped chat message, if this is one.
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Outbound::Chat(message) => Some(message.id),
            Outbound::Control(_) => None,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<ChatMessage> for Outbound {
    fn from(message: ChatMessage) -> Self {
        Outbound::Chat(message)
    }
}

impl From<ControlEvent> for Outbound {
    fn from(event: ControlEvent) -> Self {
        Outbound::Control(event)
    }
}

/// Inbound envelope, one JSON object per text frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    Join {
        #[serde(default)]
        channel: Option<String>,
    },
    Message {
        #[serde(default, alias = "text")]
        msg: Option<String>,
    },
    Leave {
        #[serde(default)]
        channel: Option<String>,
    },
}

impl ClientEvent {
    pub fn parse(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}
