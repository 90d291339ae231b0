use sqlx::SqlitePool;

use crate::db::models::MessageRow;

/// Insert a new channel message.
pub async fn insert_message(pool: &SqlitePool, row: &MessageRow) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO messages (id, channel, author, content, created_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&row.id)
    .bind(&row.channel)
    .bind(&row.author)
    .bind(&row.content)
    .bind(&row.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Fetch the newest `limit` messages of a channel, ordered newest first.
pub async fn fetch_recent(
    pool: &SqlitePool,
    channel: &str,
    limit: i64,
) -> Result<Vec<MessageRow>, sqlx::Error> {
    sqlx::query_as::<_, MessageRow>(
        "SELECT id, channel, author, content, created_at \
         FROM messages \
         WHERE channel = ? \
         ORDER BY created_at DESC, rowid DESC \
         LIMIT ?",
    )
    .bind(channel)
    .bind(limit)
    .fetch_all(pool)
    .await
}
