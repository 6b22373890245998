use std::sync::{LazyLock, Mutex};

use async_trait::async_trait;
use sqlx::SqlitePool;
use time::OffsetDateTime;
use uuid::timestamp::context::ContextV7;
use uuid::{Timestamp, Uuid};

use super::message::ChatMessage;

// Sqlite stores the timestamp as RFC 3339 text with trailing subsecond
// zeros trimmed, so its lexicographic order disagrees with time order
// (".1Z" sorts after ".15Z"). Rows are ordered by id instead, which a
// shared ContextV7 keeps monotone within the process.
static V7_CONTEXT: LazyLock<Mutex<ContextV7>> = LazyLock::new(|| Mutex::new(ContextV7::new()));

fn next_message_id() -> Uuid {
    Uuid::new_v7(Timestamp::now(&*V7_CONTEXT.lock().unwrap()))
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("message body must not be empty")]
    EmptyBody,
    #[error("message {0} not found")]
    NotFound(String),
    #[error("storage unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
}

/// Durable, ordered persistence of chat messages between two users.
///
/// A trait so the channel handler can be tested against a store that is
/// forced to fail; `SqliteStore` is the real one.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// All messages sent by `sender_id` to `receiver_id`, creation order.
    /// Deliberately not bidirectional; callers wanting both sides of a
    /// conversation query twice.
    async fn get_conversation(
        &self,
        sender_id: &str,
        receiver_id: &str,
    ) -> Result<Vec<ChatMessage>, StoreError>;

    /// Persist a new message. Assigns id and timestamp, `read` starts false.
    async fn create_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        body: &str,
        attachment_url: Option<&str>,
    ) -> Result<ChatMessage, StoreError>;

    /// Flip `read` to true. Idempotent; `NotFound` if the id doesn't exist.
    async fn mark_read(&self, id: &str) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                sender_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                message TEXT NOT NULL,
                attachment_url TEXT,
                read BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation
             ON messages (sender_id, receiver_id, id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn get_conversation(
        &self,
        sender_id: &str,
        receiver_id: &str,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let rows = sqlx::query_as::<_, ChatMessage>(
            "SELECT id, sender_id, receiver_id, message, attachment_url, read, created_at
             FROM messages
             WHERE sender_id = ? AND receiver_id = ?
             ORDER BY id",
        )
        .bind(sender_id)
        .bind(receiver_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn create_message(
        &self,
        sender_id: &str,
        receiver_id: &str,
        body: &str,
        attachment_url: Option<&str>,
    ) -> Result<ChatMessage, StoreError> {
        if body.is_empty() {
            return Err(StoreError::EmptyBody);
        }

        let msg = ChatMessage {
            id: next_message_id().to_string(),
            sender_id: sender_id.to_owned(),
            receiver_id: receiver_id.to_owned(),
            message: body.to_owned(),
            attachment_url: attachment_url.map(str::to_owned),
            read: false,
            created_at: OffsetDateTime::now_utc(),
        };

        sqlx::query(
            "INSERT INTO messages (id, sender_id, receiver_id, message, attachment_url, read, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&msg.id)
        .bind(&msg.sender_id)
        .bind(&msg.receiver_id)
        .bind(&msg.message)
        .bind(&msg.attachment_url)
        .bind(msg.read)
        .bind(msg.created_at)
        .execute(&self.pool)
        .await?;

        Ok(msg)
    }

    async fn mark_read(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE messages SET read = TRUE WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_owned()));
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use sqlx::sqlite::SqlitePoolOptions;

    use super::*;

    pub(crate) async fn memory_store() -> SqliteStore {
        // A single connection keeps every query on the same in-memory db.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteStore::new(pool);
        store.migrate().await.unwrap();
        store
    }

    #[tokio::test]
    async fn conversation_preserves_creation_order() {
        let store = memory_store().await;
        for body in ["one", "two", "three"] {
            store.create_message("u1", "u2", body, None).await.unwrap();
        }

        let msgs = store.get_conversation("u1", "u2").await.unwrap();
        let bodies: Vec<&str> = msgs.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(bodies, ["one", "two", "three"]);
    }

    #[tokio::test]
    async fn trimmed_subsecond_timestamps_do_not_reorder_retrieval() {
        let store = memory_store().await;
        // ".1Z" sorts after ".15Z" as text even though 0.1s < 0.15s; the
        // query must not lean on the timestamp column for ordering.
        let rows = [
            ("00000000-0000-7000-8000-000000000001", "2026-01-01T00:00:00.1Z", "first"),
            ("00000000-0000-7000-8000-000000000002", "2026-01-01T00:00:00.15Z", "second"),
        ];
        for (id, created_at, body) in rows {
            sqlx::query(
                "INSERT INTO messages (id, sender_id, receiver_id, message, attachment_url, read, created_at)
                 VALUES (?, 'u1', 'u2', ?, NULL, FALSE, ?)",
            )
            .bind(id)
            .bind(body)
            .bind(created_at)
            .execute(&store.pool)
            .await
            .unwrap();
        }

        let msgs = store.get_conversation("u1", "u2").await.unwrap();
        let bodies: Vec<&str> = msgs.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(bodies, ["first", "second"]);
    }

    #[tokio::test]
    async fn ids_stay_monotone_under_rapid_creation() {
        let store = memory_store().await;
        for i in 0..64 {
            store
                .create_message("u1", "u2", &format!("m{i}"), None)
                .await
                .unwrap();
        }

        let msgs = store.get_conversation("u1", "u2").await.unwrap();
        let bodies: Vec<String> = msgs.iter().map(|m| m.message.clone()).collect();
        let expected: Vec<String> = (0..64).map(|i| format!("m{i}")).collect();
        assert_eq!(bodies, expected);
        assert!(msgs.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[tokio::test]
    async fn conversation_is_direction_exact() {
        let store = memory_store().await;
        store.create_message("u1", "u2", "a", None).await.unwrap();
        store.create_message("u2", "u1", "b", None).await.unwrap();
        store.create_message("u1", "u2", "c", None).await.unwrap();
        store.create_message("u2", "u1", "d", None).await.unwrap();

        let msgs = store.get_conversation("u1", "u2").await.unwrap();
        let bodies: Vec<&str> = msgs.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(bodies, ["a", "c"]);
        assert!(msgs.iter().all(|m| m.sender_id == "u1" && m.receiver_id == "u2"));
    }

    #[tokio::test]
    async fn create_message_assigns_id_and_defaults() {
        let store = memory_store().await;
        let msg = store
            .create_message("u1", "u2", "hello", Some("https://files/x.pdf"))
            .await
            .unwrap();

        assert!(!msg.id.is_empty());
        assert!(!msg.read);
        assert_eq!(msg.attachment_url.as_deref(), Some("https://files/x.pdf"));

        let stored = store.get_conversation("u1", "u2").await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, msg.id);
        assert_eq!(stored[0].message, "hello");
        assert_eq!(stored[0].attachment_url, msg.attachment_url);
    }

    #[tokio::test]
    async fn empty_body_is_rejected() {
        let store = memory_store().await;
        let err = store.create_message("u1", "u2", "", None).await.unwrap_err();
        assert!(matches!(err, StoreError::EmptyBody));
        assert!(store.get_conversation("u1", "u2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mark_read_is_idempotent() {
        let store = memory_store().await;
        let msg = store.create_message("u1", "u2", "hi", None).await.unwrap();

        store.mark_read(&msg.id).await.unwrap();
        store.mark_read(&msg.id).await.unwrap();

        let stored = store.get_conversation("u1", "u2").await.unwrap();
        assert!(stored[0].read);
    }

    #[tokio::test]
    async fn mark_read_unknown_id_is_not_found() {
        let store = memory_store().await;
        store.create_message("u1", "u2", "hi", None).await.unwrap();

        let err = store.mark_read("nonexistent-id").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        // Store untouched.
        let stored = store.get_conversation("u1", "u2").await.unwrap();
        assert!(!stored[0].read);
    }
}
