//! Ephemeral in-memory message store.
//!
//! The default backend: a map from session id to a message vector, guarded
//! by an `RwLock`.  Nothing survives the process, which makes it the right
//! choice for tests, examples, and short-lived agents.

use super::{
    select_messages, MemoryError, MemoryStore, MessageMetadata, RetentionPolicy, StoredMessage,
};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-memory store: session-keyed message vectors behind an `RwLock`.
#[derive(Default)]
pub struct InMemoryStore {
    sessions: RwLock<HashMap<String, Vec<StoredMessage>>>,
    last_processed: RwLock<HashMap<(String, String, String), f64>>,
    policy: RwLock<RetentionPolicy>,
}

impl InMemoryStore {
    /// Create an empty store with an unbounded retention policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize a session's full message sequence to a JSON string.
    ///
    /// Together with [`restore`](InMemoryStore::restore) this supports
    /// saving a conversation to a file and reloading it later; the restored
    /// sequence compares equal to the original.
    pub async fn snapshot(&self, session_id: &str) -> Result<String, MemoryError> {
        let sessions = self.sessions.read().await;
        let messages = sessions.get(session_id).cloned().unwrap_or_default();
        serde_json::to_string(&messages).map_err(|e| MemoryError::Serialization(e.to_string()))
    }

    /// Replace a session's message sequence from a
    /// [`snapshot`](InMemoryStore::snapshot) string.
    pub async fn restore(&self, session_id: &str, snapshot: &str) -> Result<(), MemoryError> {
        let messages: Vec<StoredMessage> = serde_json::from_str(snapshot)
            .map_err(|e| MemoryError::Serialization(e.to_string()))?;
        let mut sessions = self.sessions.write().await;
        sessions.insert(session_id.to_string(), messages);
        Ok(())
    }
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn store_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        metadata: MessageMetadata,
    ) -> Result<(), MemoryError> {
        let mut sessions = self.sessions.write().await;
        let messages = sessions.entry(session_id.to_string()).or_default();

        // Timestamps must be non-decreasing within a session even if the
        // wall clock steps backwards.
        let now = chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0;
        let timestamp = match messages.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };

        messages.push(StoredMessage {
            role: role.to_string(),
            content: content.to_string(),
            session_id: session_id.to_string(),
            timestamp,
            metadata,
        });
        Ok(())
    }

    async fn get_messages(
        &self,
        session_id: &str,
        agent_name: Option<&str>,
    ) -> Result<Vec<StoredMessage>, MemoryError> {
        let policy = *self.policy.read().await;
        let sessions = self.sessions.read().await;
        let messages = sessions.get(session_id).cloned().unwrap_or_default();
        Ok(select_messages(messages, agent_name, policy))
    }

    async fn clear_memory(
        &self,
        session_id: Option<&str>,
        agent_name: Option<&str>,
    ) -> Result<(), MemoryError> {
        let mut sessions = self.sessions.write().await;
        match (session_id, agent_name) {
            (Some(sid), None) => {
                sessions.remove(sid);
            }
            (Some(sid), Some(agent)) => {
                if let Some(messages) = sessions.get_mut(sid) {
                    messages.retain(|m| m.metadata.agent_name.as_deref() != Some(agent));
                }
            }
            (None, Some(agent)) => {
                for messages in sessions.values_mut() {
                    messages.retain(|m| m.metadata.agent_name.as_deref() != Some(agent));
                }
            }
            (None, None) => sessions.clear(),
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
        let key = (
            session_id.to_string(),
            agent_name.to_string(),
            memory_type.to_string(),
        );
        self.last_processed.write().await.insert(key, timestamp);
        Ok(())
    }

    async fn get_last_processed(
        &self,
        session_id: &str,
        agent_name: &str,
        memory_type: &str,
    ) -> Result<Option<f64>, MemoryError> {
        let key = (
            session_id.to_string(),
            agent_name.to_string(),
            memory_type.to_string(),
        );
        Ok(self.last_processed.read().await.get(&key).copied())
    }

    fn backend_name(&self) -> &str {
        "in_memory"
    }
}
