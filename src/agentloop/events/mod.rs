//! Lifecycle Event System
//!
//! Agents emit typed [`Event`]s at every significant moment of a run:
//! start/finish, each step, tool calls and their outcomes, observations,
//! loop detections, limit violations, and errors.  Events are keyed by
//! session and fan out to live subscribers through an [`EventStore`]
//! backend selected by the [`EventRouter`].
//!
//! # Delivery semantics
//!
//! - Within a single session, subscribers see events in `append` order.
//!   Across sessions no order is guaranteed.
//! - Subscription is live-only: a subscriber receives events emitted from
//!   the moment of subscription onward.  There is no historical replay.
//! - A slow subscriber never blocks producers.  If its queue fills, events
//!   for that subscriber are dropped and a `subscriber_lagging` warning is
//!   logged.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentloop::events::{Event, EventRouter, EventStore, EventType};
//! use futures_util::StreamExt;
//!
//! # async {
//! let events = EventRouter::connect("in_memory").await.unwrap();
//! let mut stream = events.stream("session-1").await;
//!
//! events
//!     .append(
//!         "session-1",
//!         Event::new(EventType::AgentStarted, "session-1", "assistant", serde_json::json!({})),
//!     )
//!     .await
//!     .unwrap();
//!
//! let event = stream.next().await.unwrap();
//! assert_eq!(event.event_type, EventType::AgentStarted);
//! # };
//! ```

use async_trait::async_trait;
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;

pub mod in_memory;
#[cfg(feature = "redis-backend")]
pub mod redis_stream;

pub use in_memory::InMemoryEventStore;

/// Default capacity of the per-session event buffer and broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1000;

/// The kind of lifecycle moment an [`Event`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A run began for this session.
    AgentStarted,
    /// A ReAct step began (one LLM round trip).
    StepStarted,
    /// The model requested a tool call; payload carries the call id, tool
    /// name and arguments.
    ToolCallRequested,
    /// A requested tool call finished successfully.
    ToolCallCompleted,
    /// A requested tool call failed (error envelope, transport failure, or
    /// timeout).
    ToolCallFailed,
    /// A tool observation was recorded into working memory.
    ObservationRecorded,
    /// The model produced its final answer.
    FinalAnswer,
    /// An unrecoverable error ended the run.
    AgentError,
    /// The loop detector fired and the stuck protocol was applied.
    LoopDetected,
    /// A request or token limit stopped the run.
    LimitExceeded,
    /// The run ended (normally, cancelled, or after an error).
    AgentFinished,
}

impl EventType {
    /// The snake_case wire name of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AgentStarted => "agent_started",
            EventType::StepStarted => "step_started",
            EventType::ToolCallRequested => "tool_call_requested",
            EventType::ToolCallCompleted => "tool_call_completed",
            EventType::ToolCallFailed => "tool_call_failed",
            EventType::ObservationRecorded => "observation_recorded",
            EventType::FinalAnswer => "final_answer",
            EventType::AgentError => "agent_error",
            EventType::LoopDetected => "loop_detected",
            EventType::LimitExceeded => "limit_exceeded",
            EventType::AgentFinished => "agent_finished",
        }
    }
}

/// One lifecycle event within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// What happened.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Event-specific details (tool names, call ids, error text, …).
    pub payload: serde_json::Value,
    /// Unix seconds, UTC.
    pub timestamp: f64,
    /// Owning session.
    pub session_id: String,
    /// Agent that emitted the event.
    pub agent_name: String,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(
        event_type: EventType,
        session_id: impl Into<String>,
        agent_name: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            payload,
            timestamp: chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0,
            session_id: session_id.into(),
            agent_name: agent_name.into(),
        }
    }
}

/// A live subscription to one session's events.  Dropping the stream tears
/// the subscription down.
pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

/// Errors surfaced by event-store operations.
#[derive(Debug, Clone)]
pub enum EventError {
    /// The backing store failed.
    Backend(String),
    /// An event could not be encoded or decoded.
    Serialization(String),
    /// The backend selector did not match any compiled-in backend.
    UnknownBackend(String),
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventError::Backend(msg) => write!(f, "Event backend error: {}", msg),
            EventError::Serialization(msg) => write!(f, "Event serialization error: {}", msg),
            EventError::UnknownBackend(spec) => write!(f, "Unknown event backend: {}", spec),
        }
    }
}

impl Error for EventError {}

/// Abstract event store with live subscription.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append an event to a session.  Never blocks on slow subscribers.
    async fn append(&self, session_id: &str, event: Event) -> Result<(), EventError>;

    /// Subscribe to events emitted from this moment onward.
    async fn stream(&self, session_id: &str) -> EventStream;

    /// Identifier for logging (`"in_memory"`, `"redis_stream"`).
    fn backend_name(&self) -> &str;
}

/// Polymorphic event-store handle with construction-time backend selection,
/// mirroring [`MemoryRouter`](crate::agentloop::memory::MemoryRouter).
pub struct EventRouter {
    backend: RwLock<Arc<dyn EventStore>>,
}

impl fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventRouter").finish()
    }
}

impl EventRouter {
    /// Build a router around an existing backend.
    pub fn new(backend: Arc<dyn EventStore>) -> Self {
        Self {
            backend: RwLock::new(backend),
        }
    }

    /// Select and connect a backend from a tag.
    ///
    /// Recognised selectors: `in_memory`; `redis_stream` (redis streams at
    /// `redis://127.0.0.1:6379`, feature `redis-backend`); any `redis://…`
    /// URL (redis streams at that address).
    pub async fn connect(spec: &str) -> Result<Self, EventError> {
        if spec == "in_memory" {
            return Ok(Self::new(Arc::new(InMemoryEventStore::new(
                DEFAULT_EVENT_CAPACITY,
            ))));
        }

        if spec == "redis_stream" || spec.starts_with("redis://") {
            #[cfg(feature = "redis-backend")]
            {
                let url = if spec == "redis_stream" {
                    "redis://127.0.0.1:6379"
                } else {
                    spec
                };
                let store = redis_stream::RedisStreamEventStore::connect(url).await?;
                return Ok(Self::new(Arc::new(store)));
            }
            #[cfg(not(feature = "redis-backend"))]
            return Err(EventError::UnknownBackend(format!(
                "{} (compiled without the `redis-backend` feature)",
                spec
            )));
        }

        Err(EventError::UnknownBackend(spec.to_string()))
    }

    /// Replace the backend.  Waits for in-flight appends against the old
    /// backend to drain before the swap.
    pub async fn set_backend(&self, backend: Arc<dyn EventStore>) {
        let mut guard = self.backend.write().await;
        log::info!(
            "event backend swapped: {} -> {}",
            guard.backend_name(),
            backend.backend_name()
        );
        *guard = backend;
    }

    async fn current(&self) -> Arc<dyn EventStore> {
        self.backend.read().await.clone()
    }
}

#[async_trait]
impl EventStore for EventRouter {
    async fn append(&self, session_id: &str, event: Event) -> Result<(), EventError> {
        self.current().await.append(session_id, event).await
    }

    async fn stream(&self, session_id: &str) -> EventStream {
        self.current().await.stream(session_id).await
    }

    fn backend_name(&self) -> &str {
        "router"
    }
}
