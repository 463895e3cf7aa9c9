//! SQLite access path for persisted messages and sender display data.
//!
//! The wider platform owns the schema; this service only guarantees its
//! own `messages` table exists and treats everything else (the `users`
//! table it reads for enrichment) as externally managed.

use serde::Serialize;
use sqlx::SqlitePool;

#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub message_id: i64,
    pub sender_id: i64,
    pub receiver_id: i64,
    pub content: String,
    pub created_at: String,
}

pub async fn ensure_schema(db_pool: &SqlitePool) -> sqlx::Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS messages (
            message_id INTEGER PRIMARY KEY AUTOINCREMENT,
            sender_id INTEGER NOT NULL,
            receiver_id INTEGER NOT NULL,
            content TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .execute(db_pool)
    .await?;
    Ok(())
}

/// Insert a message and return it with the store-assigned id and
/// timestamp. Runs inside one transaction: a failed insert leaves no row
/// behind, and nothing upstream may broadcast until this has committed.
pub async fn insert_message(
    db_pool: &SqlitePool,
    sender_id: i64,
    receiver_id: i64,
    content: &str,
) -> sqlx::Result<StoredMessage> {
    let mut tx = db_pool.begin().await?;

    let message_id =
        sqlx::query("INSERT INTO messages (sender_id,receiver_id,content) VALUES (?,?,?)")
            .bind(sender_id)
            .bind(receiver_id)
            .bind(content)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

    let (created_at,): (String,) =
        sqlx::query_as("SELECT created_at FROM messages WHERE message_id=?")
            .bind(message_id)
            .fetch_one(&mut *tx)
            .await?;

    tx.commit().await?;

    Ok(StoredMessage {
        message_id,
        sender_id,
        receiver_id,
        content: content.to_owned(),
        created_at,
    })
}

/// Conversation history between two users, oldest first.
pub async fn history(
    db_pool: &SqlitePool,
    user1: i64,
    user2: i64,
) -> sqlx::Result<Vec<StoredMessage>> {
    let rows: Vec<(i64, i64, i64, String, String)> = sqlx::query_as(
        "SELECT message_id,sender_id,receiver_id,content,created_at FROM messages
         WHERE (sender_id=? AND receiver_id=?) OR (sender_id=? AND receiver_id=?)
         ORDER BY message_id",
    )
    .bind(user1)
    .bind(user2)
    .bind(user2)
    .bind(user1)
    .fetch_all(db_pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(
            |(message_id, sender_id, receiver_id, content, created_at)| StoredMessage {
                message_id,
                sender_id,
                receiver_id,
                content,
                created_at,
            },
        )
        .collect())
}

/// Sender display data for message enrichment. Best-effort: a missing
/// profile row, or a users table this deployment does not carry, degrades
/// to a placeholder identity instead of failing the send.
pub async fn sender_profile(db_pool: &SqlitePool, user_id: i64) -> (String, Option<String>) {
    let row: Option<(String, Option<String>)> =
        sqlx::query_as("SELECT username,pfp_path FROM users WHERE user_id=?")
            .bind(user_id)
            .fetch_optional(db_pool)
            .await
            .ok()
            .flatten();

    row.unwrap_or(("Anonymous".to_owned(), None))
}
