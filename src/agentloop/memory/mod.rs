//! Session Memory Substrate
//!
//! This module provides the message store that backs agent sessions: an
//! abstract [`MemoryStore`] trait with swappable backends and a
//! [`MemoryRouter`] that selects a backend from a URL or tag at
//! construction time.
//!
//! # Backends
//!
//! - **In-memory** ([`InMemoryStore`]): session-keyed vectors behind an
//!   `RwLock`.  The default; nothing survives the process.
//! - **Redis** (`redis://host:port[/db]`, feature `redis-backend`): one
//!   list-valued key per session, messages serialized as JSON.
//! - **Relational** (`sqlite://…`, `postgresql://…`, `mysql://…`, features
//!   `persistence-*`): two tables, `messages` and
//!   `last_processed_messages`, with metadata stored as a JSON text column.
//!
//! All backends share the same semantics: writes are append-only and never
//! discard; the retention policy is applied at **read** time, so
//! `get_messages` is a pure function of the stored sequence and the policy.
//! When both an agent-name filter and a policy apply, the filter is applied
//! first, then retention.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentloop::memory::{MemoryRouter, MemoryStore, MessageMetadata, RetentionPolicy};
//!
//! # async {
//! let memory = MemoryRouter::connect("in_memory").await.unwrap();
//! memory.set_retention_policy(RetentionPolicy::SlidingWindow(50)).await;
//!
//! memory
//!     .store_message("session-1", "user", "hello", MessageMetadata::for_agent("assistant"))
//!     .await
//!     .unwrap();
//!
//! let history = memory.get_messages("session-1", None).await.unwrap();
//! assert_eq!(history.len(), 1);
//! # };
//! ```

use crate::agentloop::config::{MemoryConfig, MemoryMode};
use crate::agentloop::llm::ToolCallSpec;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod in_memory;
#[cfg(feature = "persistence-mysql")]
pub mod mysql;
#[cfg(feature = "persistence-postgres")]
pub mod postgres;
#[cfg(feature = "redis-backend")]
pub mod redis;
#[cfg(feature = "persistence-sqlite")]
pub mod sqlite;

pub use in_memory::InMemoryStore;

/// Free-form metadata attached to a stored message.
///
/// By convention carries the producing agent's name; assistant messages that
/// requested tools additionally carry the declared [`ToolCallSpec`]s, and
/// tool-result messages carry the `tool_call_id` they answer.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageMetadata {
    /// Name of the agent that produced the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    /// For tool-role messages: the id of the tool call being answered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Whether this assistant message declared tool calls.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub has_tool_calls: bool,
    /// The declared tool calls, in declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallSpec>,
    /// Anything else callers want to stash alongside the message.
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MessageMetadata {
    /// Metadata carrying only the agent name.
    pub fn for_agent(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: Some(agent_name.into()),
            ..Self::default()
        }
    }

    /// Metadata for an assistant message that declared tool calls.
    pub fn with_tool_calls(agent_name: impl Into<String>, tool_calls: Vec<ToolCallSpec>) -> Self {
        Self {
            agent_name: Some(agent_name.into()),
            has_tool_calls: true,
            tool_calls,
            ..Self::default()
        }
    }

    /// Metadata for a tool-result message answering `tool_call_id`.
    pub fn for_tool_result(
        agent_name: impl Into<String>,
        tool_call_id: impl Into<String>,
    ) -> Self {
        Self {
            agent_name: Some(agent_name.into()),
            tool_call_id: Some(tool_call_id.into()),
            ..Self::default()
        }
    }
}

/// A message persisted within a session.
///
/// Messages are created by [`MemoryStore::store_message`], never mutated, and
/// destroyed only by [`MemoryStore::clear_memory`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredMessage {
    /// `system`, `user`, `assistant` or `tool`.
    pub role: String,
    /// Message body.
    pub content: String,
    /// Owning session.
    pub session_id: String,
    /// Unix seconds, UTC.  Non-decreasing within a session.
    pub timestamp: f64,
    /// Free-form metadata (agent name, tool-call descriptors, …).
    #[serde(default)]
    pub metadata: MessageMetadata,
}

/// Bounded-context retention applied when reading a session back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Keep every message.
    Unbounded,
    /// Keep at most this many most-recent messages.
    SlidingWindow(usize),
    /// Drop oldest messages until the whitespace-split token count over
    /// `content` fits the budget.
    TokenBudget(usize),
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        RetentionPolicy::Unbounded
    }
}

impl From<&MemoryConfig> for RetentionPolicy {
    fn from(config: &MemoryConfig) -> Self {
        match config.mode {
            MemoryMode::SlidingWindow => RetentionPolicy::SlidingWindow(config.value),
            MemoryMode::TokenBudget => RetentionPolicy::TokenBudget(config.value),
        }
    }
}

/// Errors surfaced by message-store operations.
#[derive(Debug, Clone)]
pub enum MemoryError {
    /// The backing store failed (I/O, network, SQL).
    Backend(String),
    /// A stored message could not be encoded or decoded.
    Serialization(String),
    /// The backend selector did not match any compiled-in backend.
    UnknownBackend(String),
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::Backend(msg) => write!(f, "Memory backend error: {}", msg),
            MemoryError::Serialization(msg) => write!(f, "Message serialization error: {}", msg),
            MemoryError::UnknownBackend(spec) => write!(f, "Unknown memory backend: {}", spec),
        }
    }
}

impl Error for MemoryError {}

/// Abstract message store.  All backends implement this contract.
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Append a message to a session.  Sessions are created lazily on first
    /// store.  Writes never discard.
    async fn store_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        metadata: MessageMetadata,
    ) -> Result<(), MemoryError>;

    /// Ordered messages for a session, with the optional agent-name filter
    /// applied first and the retention policy applied second.
    async fn get_messages(
        &self,
        session_id: &str,
        agent_name: Option<&str>,
    ) -> Result<Vec<StoredMessage>, MemoryError>;

    /// Remove messages.  Both filters optional; omitted means "all".
    async fn clear_memory(
        &self,
        session_id: Option<&str>,
        agent_name: Option<&str>,
    ) -> Result<(), MemoryError>;

    /// Replace the retention policy applied by subsequent reads.
    async fn set_retention_policy(&self, policy: RetentionPolicy);

    /// Record a long-term-memory processing watermark.
    async fn set_last_processed(
        &self,
        session_id: &str,
        agent_name: &str,
        memory_type: &str,
        timestamp: f64,
    ) -> Result<(), MemoryError>;

    /// Read back a watermark recorded by
    /// [`set_last_processed`](MemoryStore::set_last_processed).
    async fn get_last_processed(
        &self,
        session_id: &str,
        agent_name: &str,
        memory_type: &str,
    ) -> Result<Option<f64>, MemoryError>;

    /// Identifier for logging (`"in_memory"`, `"redis"`, `"sqlite"`, …).
    fn backend_name(&self) -> &str;
}

/// Render a unix-seconds timestamp as an ISO-8601 string for the relational
/// backends' portable `timestamp` column.
#[cfg(any(
    feature = "persistence-sqlite",
    feature = "persistence-postgres",
    feature = "persistence-mysql"
))]
pub(crate) fn unix_to_iso(timestamp: f64) -> String {
    use chrono::{SecondsFormat, TimeZone, Utc};
    let micros = (timestamp * 1_000_000.0).round() as i64;
    match Utc.timestamp_micros(micros) {
        chrono::LocalResult::Single(dt) => dt.to_rfc3339_opts(SecondsFormat::Micros, true),
        _ => Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
    }
}

/// Parse an ISO-8601 `timestamp` column value back into unix seconds.
#[cfg(any(
    feature = "persistence-sqlite",
    feature = "persistence-postgres",
    feature = "persistence-mysql"
))]
pub(crate) fn iso_to_unix(iso: &str) -> Result<f64, MemoryError> {
    chrono::DateTime::parse_from_rfc3339(iso)
        .map(|dt| dt.timestamp_micros() as f64 / 1_000_000.0)
        .map_err(|e| MemoryError::Serialization(format!("bad timestamp {:?}: {}", iso, e)))
}

/// Apply the agent-name filter, then the retention policy.  Pure function;
/// shared by every backend so the read path behaves identically everywhere.
pub(crate) fn select_messages(
    messages: Vec<StoredMessage>,
    agent_name: Option<&str>,
    policy: RetentionPolicy,
) -> Vec<StoredMessage> {
    let mut messages: Vec<StoredMessage> = match agent_name {
        Some(name) => messages
            .into_iter()
            .filter(|m| m.metadata.agent_name.as_deref() == Some(name))
            .collect(),
        None => messages,
    };

    match policy {
        RetentionPolicy::Unbounded => messages,
        RetentionPolicy::SlidingWindow(window) => {
            if messages.len() > window {
                messages.split_off(messages.len() - window)
            } else {
                messages
            }
        }
        RetentionPolicy::TokenBudget(budget) => {
            let token_count =
                |msgs: &[StoredMessage]| -> usize {
                    msgs.iter()
                        .map(|m| m.content.split_whitespace().count())
                        .sum()
                };
            let mut start = 0;
            while start < messages.len() && token_count(&messages[start..]) > budget {
                start += 1;
            }
            messages.split_off(start)
        }
    }
}

/// Polymorphic message-store handle with construction-time backend selection.
///
/// The router is what agents hold.  It implements [`MemoryStore`] by
/// delegation and supports hot-swapping the backend via
/// [`set_backend`](MemoryRouter::set_backend): the swap happens under the
/// router's write lock, so every in-flight operation against the old backend
/// drains before the replacement becomes visible.
pub struct MemoryRouter {
    backend: RwLock<Arc<dyn MemoryStore>>,
}

impl fmt::Debug for MemoryRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRouter").finish()
    }
}

impl MemoryRouter {
    /// Build a router around an existing backend.
    pub fn new(backend: Arc<dyn MemoryStore>) -> Self {
        Self {
            backend: RwLock::new(backend),
        }
    }

    /// Select and connect a backend from a URL or tag.
    ///
    /// Recognised selectors:
    ///
    /// | selector | backend | feature |
    /// |----------|---------|---------|
    /// | `in_memory` | [`InMemoryStore`] | (always available) |
    /// | `redis://…` | redis list store | `redis-backend` |
    /// | `sqlite://…` | sqlx sqlite store | `persistence-sqlite` |
    /// | `postgresql://…`, `postgres://…` | sqlx postgres store | `persistence-postgres` |
    /// | `mysql://…` | sqlx mysql store | `persistence-mysql` |
    pub async fn connect(spec: &str) -> Result<Self, MemoryError> {
        if spec == "in_memory" {
            return Ok(Self::new(Arc::new(InMemoryStore::new())));
        }

        if spec.starts_with("redis://") {
            #[cfg(feature = "redis-backend")]
            {
                let store = redis::RedisMemoryStore::connect(spec).await?;
                return Ok(Self::new(Arc::new(store)));
            }
            #[cfg(not(feature = "redis-backend"))]
            return Err(MemoryError::UnknownBackend(format!(
                "{} (compiled without the `redis-backend` feature)",
                spec
            )));
        }

        if spec.starts_with("sqlite:") {
            #[cfg(feature = "persistence-sqlite")]
            {
                let store = sqlite::SqliteMemoryStore::connect(spec).await?;
                return Ok(Self::new(Arc::new(store)));
            }
            #[cfg(not(feature = "persistence-sqlite"))]
            return Err(MemoryError::UnknownBackend(format!(
                "{} (compiled without the `persistence-sqlite` feature)",
                spec
            )));
        }

        if spec.starts_with("postgresql://") || spec.starts_with("postgres://") {
            #[cfg(feature = "persistence-postgres")]
            {
                let store = postgres::PostgresMemoryStore::connect(spec).await?;
                return Ok(Self::new(Arc::new(store)));
            }
            #[cfg(not(feature = "persistence-postgres"))]
            return Err(MemoryError::UnknownBackend(format!(
                "{} (compiled without the `persistence-postgres` feature)",
                spec
            )));
        }

        if spec.starts_with("mysql://") {
            #[cfg(feature = "persistence-mysql")]
            {
                let store = mysql::MysqlMemoryStore::connect(spec).await?;
                return Ok(Self::new(Arc::new(store)));
            }
            #[cfg(not(feature = "persistence-mysql"))]
            return Err(MemoryError::UnknownBackend(format!(
                "{} (compiled without the `persistence-mysql` feature)",
                spec
            )));
        }

        Err(MemoryError::UnknownBackend(spec.to_string()))
    }

    /// Replace the backend.  Waits for in-flight operations against the old
    /// backend to drain before the swap.
    pub async fn set_backend(&self, backend: Arc<dyn MemoryStore>) {
        let mut guard = self.backend.write().await;
        log::info!(
            "memory backend swapped: {} -> {}",
            guard.backend_name(),
            backend.backend_name()
        );
        *guard = backend;
    }

    /// Apply an agent's [`MemoryConfig`] as the retention policy.
    pub async fn apply_memory_config(&self, config: &MemoryConfig) {
        self.set_retention_policy(RetentionPolicy::from(config))
            .await;
    }

    async fn current(&self) -> Arc<dyn MemoryStore> {
        self.backend.read().await.clone()
    }
}

#[async_trait]
impl MemoryStore for MemoryRouter {
    async fn store_message(
        &self,
        session_id: &str,
        role: &str,
        content: &str,
        metadata: MessageMetadata,
    ) -> Result<(), MemoryError> {
        self.current()
            .await
            .store_message(session_id, role, content, metadata)
            .await
    }

    async fn get_messages(
        &self,
        session_id: &str,
        agent_name: Option<&str>,
    ) -> Result<Vec<StoredMessage>, MemoryError> {
        self.current()
            .await
            .get_messages(session_id, agent_name)
            .await
    }

    async fn clear_memory(
        &self,
        session_id: Option<&str>,
        agent_name: Option<&str>,
    ) -> Result<(), MemoryError> {
        self.current()
            .await
            .clear_memory(session_id, agent_name)
            .await
    }

    async fn set_retention_policy(&self, policy: RetentionPolicy) {
        self.current().await.set_retention_policy(policy).await
    }

    async fn set_last_processed(
        &self,
        session_id: &str,
        agent_name: &str,
        memory_type: &str,
        timestamp: f64,
    ) -> Result<(), MemoryError> {
        self.current()
            .await
            .set_last_processed(session_id, agent_name, memory_type, timestamp)
            .await
    }

    async fn get_last_processed(
        &self,
        session_id: &str,
        agent_name: &str,
        memory_type: &str,
    ) -> Result<Option<f64>, MemoryError> {
        self.current()
            .await
            .get_last_processed(session_id, agent_name, memory_type)
            .await
    }

    fn backend_name(&self) -> &str {
        "router"
    }
}
