use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::events::ChatMessage;
use crate::engine::store::StoreError;

/// A stored channel message from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MessageRow {
    pub id: String,
    pub channel: String,
    pub author: String,
    pub content: String,
    /// RFC 3339, UTC, fixed microsecond precision so text order is time order.
    pub created_at: String,
}

impl MessageRow {
    pub fn from_message(message: &ChatMessage) -> Self {
        Self {
            id: message.id.to_string(),
            channel: message.channel.clone(),
            author: message.user.clone(),
            content: message.msg.clone(),
            created_at: format_timestamp(message.time),
        }
    }

    pub fn into_message(self) -> Result<ChatMessage, StoreError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| StoreError::InvalidRow(format!("id {}: {e}", self.id)))?;
        let time = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| StoreError::InvalidRow(format!("created_at {}: {e}", self.created_at)))?
            .with_timezone(&Utc);
        Ok(ChatMessage {
            id,
            user: self.author,
            msg: self.content,
            channel: self.channel,
            time,
        })
    }
}

pub fn format_timestamp(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}
