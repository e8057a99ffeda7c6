//! Redis-backed message store.
//!
//! Same semantics as the in-memory backend: each session is one list-valued
//! key (`agentloop:messages:<session_id>`) holding JSON-serialized messages,
//! and the retention policy is still applied at read time.  Watermarks live
//! in a hash per session keyed by `<agent_name>:<memory_type>`.

use super::{
    select_messages, MemoryError, MemoryStore, MessageMetadata, RetentionPolicy, StoredMessage,
};
use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::RwLock;

fn messages_key(session_id: &str) -> String {
    format!("agentloop:messages:{}", session_id)
}

fn watermarks_key(session_id: &str) -> String {
    format!("agentloop:last_processed:{}", session_id)
}

/// Message store backed by a redis list per session.
pub struct RedisMemoryStore {
    connection: redis::aio::MultiplexedConnection,
    policy: RwLock<RetentionPolicy>,
}

impl RedisMemoryStore {
    /// Connect to `redis://host:port[/db]`.
    pub async fn connect(url: &str) -> Result<Self, MemoryError> {
        let client =
            redis::Client::open(url).map_err(|e| MemoryError::Backend(e.to_string()))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| MemoryError::Backend(e.to_string()))?;
        Ok(Self {
            connection,
            policy: RwLock::new(RetentionPolicy::Unbounded),
        })
    }

    async fn load_session(&self, session_id: &str) -> Result<Vec<StoredMessage>, MemoryError> {
        let mut con = self.connection.clone();
        let raw: Vec<String> = con
            .lrange(messages_key(session_id), 0, -1)
            .await
            .map_err(|e| MemoryError::Backend(e.to_string()))?;
        raw.iter()
            .map(|item| {
                serde_json::from_str(item).map_err(|e| MemoryError::Serialization(e.to_string()))
            })
            .collect()
    }
}

#[async_trait]
impl MemoryStore for RedisMemoryStore {
    async fn store_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        metadata: MessageMetadata,
    ) -> Result<(), MemoryError> {
        let mut con = self.connection.clone();
        let key = messages_key(session_id);

        // Clamp against the newest stored timestamp so the per-session
        // sequence stays non-decreasing.
        let now = chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        let newest: Option<String> = con
            .lindex(&key, -1)
            .await
            .map_err(|e| MemoryError::Backend(e.to_string()))?;
        let timestamp = newest
            .and_then(|raw| serde_json::from_str::<StoredMessage>(&raw).ok())
            .map(|last| if last.timestamp > now { last.timestamp } else { now })
            .unwrap_or(now);

        let message = StoredMessage {
            role: role.to_string(),
            content: content.to_string(),
            session_id: session_id.to_string(),
            timestamp,
            metadata,
        };
        let encoded = serde_json::to_string(&message)
            .map_err(|e| MemoryError::Serialization(e.to_string()))?;
        let _: () = con
            .rpush(&key, encoded)
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
        let mut con = self.connection.clone();
        let session_keys: Vec<String> = match session_id {
            Some(sid) => vec![messages_key(sid)],
            None => con
                .keys("agentloop:messages:*")
                .await
                .map_err(|e| MemoryError::Backend(e.to_string()))?,
        };

        for key in session_keys {
            match agent_name {
                None => {
                    let _: () = con
                        .del(&key)
                        .await
                        .map_err(|e| MemoryError::Backend(e.to_string()))?;
                }
                Some(agent) => {
                    // Rewrite the list without the filtered agent's messages.
                    let raw: Vec<String> = con
                        .lrange(&key, 0, -1)
                        .await
                        .map_err(|e| MemoryError::Backend(e.to_string()))?;
                    let kept: Vec<String> = raw
                        .into_iter()
                        .filter(|item| {
                            serde_json::from_str::<StoredMessage>(item)
                                .map(|m| m.metadata.agent_name.as_deref() != Some(agent))
                                .unwrap_or(true)
                        })
                        .collect();
                    let _: () = con
                        .del(&key)
                        .await
                        .map_err(|e| MemoryError::Backend(e.to_string()))?;
                    if !kept.is_empty() {
                        let _: () = con
                            .rpush(&key, kept)
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
        let mut con = self.connection.clone();
        let _: () = con
            .hset(
                watermarks_key(session_id),
                format!("{}:{}", agent_name, memory_type),
                timestamp,
            )
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
        let mut con = self.connection.clone();
        con.hget(
            watermarks_key(session_id),
            format!("{}:{}", agent_name, memory_type),
        )
        .await
        .map_err(|e| MemoryError::Backend(e.to_string()))
    }

    fn backend_name(&self) -> &str {
        "redis"
    }
}

// Live-service tests: run against a local redis with
// `cargo test --features redis-backend -- --ignored`.
// Override the target with AGENTLOOP_TEST_REDIS_URL.
#[cfg(test)]
mod tests {
    use super::*;

    fn test_url() -> String {
        std::env::var("AGENTLOOP_TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    fn session() -> String {
        format!("test_{}", uuid::Uuid::new_v4().simple())
    }

    #[tokio::test]
    #[ignore]
    async fn round_trip_through_redis() {
        let store = RedisMemoryStore::connect(&test_url()).await.unwrap();
        let sid = session();

        store
            .store_message(&sid, "user", "hello", MessageMetadata::for_agent("bot"))
            .await
            .unwrap();
        store
            .store_message(&sid, "assistant", "hi there", MessageMetadata::for_agent("bot"))
            .await
            .unwrap();

        let messages = store.get_messages(&sid, None).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "hello");
        assert_eq!(messages[1].role, "assistant");
        assert!(messages[0].timestamp <= messages[1].timestamp);
        assert_eq!(messages[1].metadata.agent_name.as_deref(), Some("bot"));

        store.clear_memory(Some(&sid), None).await.unwrap();
        assert!(store.get_messages(&sid, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore]
    async fn clear_by_agent_rewrites_the_list() {
        let store = RedisMemoryStore::connect(&test_url()).await.unwrap();
        let sid = session();

        store
            .store_message(&sid, "user", "mine", MessageMetadata::for_agent("alpha"))
            .await
            .unwrap();
        store
            .store_message(&sid, "user", "theirs", MessageMetadata::for_agent("beta"))
            .await
            .unwrap();

        store.clear_memory(Some(&sid), Some("alpha")).await.unwrap();
        let remaining = store.get_messages(&sid, None).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].content, "theirs");

        store.clear_memory(Some(&sid), None).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn retention_applies_at_read_time() {
        let store = RedisMemoryStore::connect(&test_url()).await.unwrap();
        let sid = session();

        for i in 0..5 {
            store
                .store_message(
                    &sid,
                    "user",
                    &format!("message {}", i),
                    MessageMetadata::default(),
                )
                .await
                .unwrap();
        }

        store
            .set_retention_policy(RetentionPolicy::SlidingWindow(2))
            .await;
        let windowed = store.get_messages(&sid, None).await.unwrap();
        assert_eq!(windowed.len(), 2);
        assert_eq!(windowed[0].content, "message 3");

        store.set_retention_policy(RetentionPolicy::Unbounded).await;
        assert_eq!(store.get_messages(&sid, None).await.unwrap().len(), 5);

        store.clear_memory(Some(&sid), None).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn watermarks_round_trip() {
        let store = RedisMemoryStore::connect(&test_url()).await.unwrap();
        let sid = session();

        assert!(store
            .get_last_processed(&sid, "bot", "episodic")
            .await
            .unwrap()
            .is_none());
        store
            .set_last_processed(&sid, "bot", "episodic", 42.0)
            .await
            .unwrap();
        assert_eq!(
            store
                .get_last_processed(&sid, "bot", "episodic")
                .await
                .unwrap(),
            Some(42.0)
        );
    }
}
