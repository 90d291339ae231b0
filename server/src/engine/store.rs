use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;

use super::events::ChatMessage;

/// Default number of messages replayed to a session on join.
pub const DEFAULT_HISTORY_LIMIT: usize = 10;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid stored message: {0}")]
    InvalidRow(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable message persistence. Implementations must be safe to share across
/// every session.
///
/// `recent_by_channel` returns the newest `limit` messages of a channel in
/// chronological order (oldest first).
pub trait MessageStore: Send + Sync + 'static {
    /// Persist a message. Must be durable before returning `Ok`.
    fn save(&self, message: &ChatMessage) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn recent_by_channel(
        &self,
        channel: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<ChatMessage>, StoreError>> + Send;
}

/// Process-local store, for tests and database-less runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: Mutex<Vec<ChatMessage>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MessageStore for MemoryStore {
    async fn save(&self, message: &ChatMessage) -> Result<(), StoreError> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        Ok(())
    }

    async fn recent_by_channel(
        &self,
        channel: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let messages = self.messages.lock().unwrap_or_else(PoisonError::into_inner);
        let mut recent: Vec<ChatMessage> = messages
            .iter()
            .rev()
            .filter(|m| m.channel == channel)
            .take(limit)
            .cloned()
            .collect();
        recent.reverse();
        Ok(recent)
    }
}
