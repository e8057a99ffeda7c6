//! SQLite-backed message store.
//!
//! Two tables, created on connect:
//!
//! - `messages(id, session_id, role, content, created_at, timestamp, msg_metadata)`
//! - `last_processed_messages(id, session_id, agent_name, memory_type, timestamp, last_processed_at)`
//!
//! Metadata is a JSON-encoded text column.  The insertion wall-clock lands in
//! `created_at`; the `timestamp` column carries the message time as an
//! ISO-8601 string so the data stays portable across engines.  Retention is
//! applied at read time like every other backend.

use super::{
    iso_to_unix, select_messages, unix_to_iso, MemoryError, MemoryStore, MessageMetadata,
    RetentionPolicy, StoredMessage,
};
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tokio::sync::RwLock;

/// Message store backed by SQLite via sqlx.
pub struct SqliteMemoryStore {
    pool: SqlitePool,
    policy: RwLock<RetentionPolicy>,
}

impl SqliteMemoryStore {
    /// Connect to `sqlite:///path.db` (or `sqlite::memory:`) and run
    /// migrations.
    pub async fn connect(database_url: &str) -> Result<Self, MemoryError> {
        // An in-memory database exists per connection, so it must not be
        // spread across a pool.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| MemoryError::Backend(e.to_string()))?;

        let store = Self {
            pool,
            policy: RwLock::new(RetentionPolicy::Unbounded),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), MemoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                timestamp TEXT NOT NULL,
                msg_metadata TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MemoryError::Backend(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS last_processed_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                agent_name TEXT NOT NULL,
                memory_type TEXT NOT NULL,
                timestamp REAL NOT NULL,
                last_processed_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(session_id, agent_name, memory_type)
            )
        "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MemoryError::Backend(e.to_string()))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id)")
            .execute(&self.pool)
            .await
            .map_err(|e| MemoryError::Backend(e.to_string()))?;

        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> Result<Vec<StoredMessage>, MemoryError> {
        let rows = sqlx::query(
            "SELECT role, content, session_id, timestamp, msg_metadata \
             FROM messages WHERE session_id = ? ORDER BY id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MemoryError::Backend(e.to_string()))?;

        rows.into_iter()
            .map(|row| {
                let iso: String = row
                    .try_get("timestamp")
                    .map_err(|e| MemoryError::Backend(e.to_string()))?;
                let metadata_json: String = row
                    .try_get("msg_metadata")
                    .map_err(|e| MemoryError::Backend(e.to_string()))?;
                let metadata: MessageMetadata = serde_json::from_str(&metadata_json)
                    .map_err(|e| MemoryError::Serialization(e.to_string()))?;
                Ok(StoredMessage {
                    role: row
                        .try_get("role")
                        .map_err(|e| MemoryError::Backend(e.to_string()))?,
                    content: row
                        .try_get("content")
                        .map_err(|e| MemoryError::Backend(e.to_string()))?,
                    session_id: row
                        .try_get("session_id")
                        .map_err(|e| MemoryError::Backend(e.to_string()))?,
                    timestamp: iso_to_unix(&iso)?,
                    metadata,
                })
            })
            .collect()
    }
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn store_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        metadata: MessageMetadata,
    ) -> Result<(), MemoryError> {
        let now = chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        let newest: Option<String> = sqlx::query_scalar(
            "SELECT timestamp FROM messages WHERE session_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| MemoryError::Backend(e.to_string()))?;
        let timestamp = match newest.as_deref().map(iso_to_unix) {
            Some(Ok(last)) if last > now => last,
            _ => now,
        };

        let metadata_json = serde_json::to_string(&metadata)
            .map_err(|e| MemoryError::Serialization(e.to_string()))?;
        sqlx::query(
            "INSERT INTO messages (session_id, role, content, timestamp, msg_metadata) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(role)
        .bind(content)
        .bind(unix_to_iso(timestamp))
        .bind(metadata_json)
        .execute(&self.pool)
        .await
        .map_err(|e| MemoryError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get_messages(
        &self,
        session_id: &str,
        agent_name: Option<&str>,
    ) -> Result<Vec<StoredMessage>, MemoryError> {
        let policy = *self.policy.read().await;
        let messages = self.load_session(session_id).await?;
        Ok(select_messages(messages, agent_name, policy))
    }

    async fn clear_memory(
        &self,
        session_id: Option<&str>,
        agent_name: Option<&str>,
    ) -> Result<(), MemoryError> {
        match (session_id, agent_name) {
            (Some(sid), None) => {
                sqlx::query("DELETE FROM messages WHERE session_id = ?")
                    .bind(sid)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| MemoryError::Backend(e.to_string()))?;
            }
            (None, None) => {
                sqlx::query("DELETE FROM messages")
                    .execute(&self.pool)
                    .await
                    .map_err(|e| MemoryError::Backend(e.to_string()))?;
            }
            (sid, Some(agent)) => {
                // Agent name lives inside the JSON metadata column, so filter
                // in Rust and delete by id.
                let rows = match sid {
                    Some(sid) => sqlx::query(
                        "SELECT id, msg_metadata FROM messages WHERE session_id = ?",
                    )
                    .bind(sid)
                    .fetch_all(&self.pool)
                    .await,
                    None => {
                        sqlx::query("SELECT id, msg_metadata FROM messages")
                            .fetch_all(&self.pool)
                            .await
                    }
                }
                .map_err(|e| MemoryError::Backend(e.to_string()))?;

                for row in rows {
                    let id: i64 = row
                        .try_get("id")
                        .map_err(|e| MemoryError::Backend(e.to_string()))?;
                    let metadata_json: String = row
                        .try_get("msg_metadata")
                        .map_err(|e| MemoryError::Backend(e.to_string()))?;
                    let matches = serde_json::from_str::<MessageMetadata>(&metadata_json)
                        .map(|m| m.agent_name.as_deref() == Some(agent))
                        .unwrap_or(false);
                    if matches {
                        sqlx::query("DELETE FROM messages WHERE id = ?")
                            .bind(id)
                            .execute(&self.pool)
                            .await
                            .map_err(|e| MemoryError::Backend(e.to_string()))?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn set_retention_policy(&self, policy: RetentionPolicy) {
        *self.policy.write().await = policy;
    }

    async fn set_last_processed(
        &self,
        session_id: &str,
        agent_name: &str,
        memory_type: &str,
        timestamp: f64,
    ) -> Result<(), MemoryError> {
        sqlx::query(
            "INSERT INTO last_processed_messages (session_id, agent_name, memory_type, timestamp) \
             VALUES (?, ?, ?, ?) \
             ON CONFLICT(session_id, agent_name, memory_type) \
             DO UPDATE SET timestamp = excluded.timestamp, last_processed_at = CURRENT_TIMESTAMP",
        )
        .bind(session_id)
        .bind(agent_name)
        .bind(memory_type)
        .bind(timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| MemoryError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get_last_processed(
        &self,
        session_id: &str,
        agent_name: &str,
        memory_type: &str,
    ) -> Result<Option<f64>, MemoryError> {
        sqlx::query_scalar(
            "SELECT timestamp FROM last_processed_messages \
             WHERE session_id = ? AND agent_name = ? AND memory_type = ?",
        )
        .bind(session_id)
        .bind(agent_name)
        .bind(memory_type)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| MemoryError::Backend(e.to_string()))
    }

    fn backend_name(&self) -> &str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_through_sqlite() {
        let store = SqliteMemoryStore::connect("sqlite::memory:").await.unwrap();
        store
            .store_message("s1", "user", "hello", MessageMetadata::for_agent("bot"))
            .await
            .unwrap();
        store
            .store_message("s1", "assistant", "hi there", MessageMetadata::for_agent("bot"))
            .await
            .unwrap();

        let messages = store.get_messages("s1", None).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].content, "hi there");
        assert!(messages[0].timestamp <= messages[1].timestamp);
        assert_eq!(messages[0].metadata.agent_name.as_deref(), Some("bot"));
    }

    #[tokio::test]
    async fn clear_by_agent_deletes_only_that_agent() {
        let store = SqliteMemoryStore::connect("sqlite::memory:").await.unwrap();
        store
            .store_message("s", "user", "a", MessageMetadata::for_agent("alpha"))
            .await
            .unwrap();
        store
            .store_message("s", "user", "b", MessageMetadata::for_agent("beta"))
            .await
            .unwrap();
        store.clear_memory(Some("s"), Some("alpha")).await.unwrap();
        let remaining = store.get_messages("s", None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].content, "b");
    }

    #[tokio::test]
    async fn watermark_upsert() {
        let store = SqliteMemoryStore::connect("sqlite::memory:").await.unwrap();
        store
            .set_last_processed("s", "bot", "episodic", 1.0)
            .await
            .unwrap();
        store
            .set_last_processed("s", "bot", "episodic", 2.0)
            .await
            .unwrap();
        assert_eq!(
            store.get_last_processed("s", "bot", "episodic").await.unwrap(),
            Some(2.0)
        );
    }
}
