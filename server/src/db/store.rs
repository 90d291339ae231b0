use sqlx::SqlitePool;
use tracing::debug;

use crate::db::models::MessageRow;
use crate::db::queries;
use crate::engine::events::ChatMessage;
use crate::engine::store::{MessageStore, StoreError};

/// [`MessageStore`] backed by the SQLite `messages` table.
#[derive(Debug, Clone)]
pub struct SqliteMessageStore {
    pool: SqlitePool,
}

impl SqliteMessageStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

impl MessageStore for SqliteMessageStore {
    async fn save(&self, message: &ChatMessage) -> Result<(), StoreError> {
        let row = MessageRow::from_message(message);
        queries::messages::insert_message(&self.pool, &row).await?;
        debug!(id = %message.id, channel = %message.channel, "message persisted");
        Ok(())
    }

    async fn recent_by_channel(
        &self,
        channel: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = queries::messages::fetch_recent(&self.pool, channel, limit).await?;

        let mut messages = rows
            .into_iter()
            .map(MessageRow::into_message)
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }
}
