//! Ephemeral event store: broadcast channels plus a bounded ring buffer.
//!
//! Each session owns a `tokio::sync::broadcast` channel (live fan-out) and a
//! bounded `VecDeque` of recent events (inspection/debugging).  When the
//! buffer is full the oldest event is dropped with a warning; a subscriber
//! that falls behind the channel capacity skips ahead with a
//! `subscriber_lagging` warning rather than blocking producers.

use super::{Event, EventError, EventStore, EventStream};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::{HashMap, VecDeque};
use tokio::sync::broadcast;
use tokio::sync::RwLock;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

struct SessionChannel {
    sender: broadcast::Sender<Event>,
    buffer: VecDeque<Event>,
}

/// In-memory event store with per-session broadcast fan-out.
pub struct InMemoryEventStore {
    sessions: RwLock<HashMap<String, SessionChannel>>,
    capacity: usize,
}

impl InMemoryEventStore {
    /// Create a store whose per-session buffers and channels hold at most
    /// `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Snapshot of the buffered (most recent) events for a session.
    pub async fn recent(&self, session_id: &str) -> Vec<Event> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .map(|s| s.buffer.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new(super::DEFAULT_EVENT_CAPACITY)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, session_id: &str, event: Event) -> Result<(), EventError> {
        let mut sessions = self.sessions.write().await;
        let capacity = self.capacity;
        let channel = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionChannel {
                sender: broadcast::channel(capacity).0,
                buffer: VecDeque::with_capacity(capacity),
            });

        if channel.buffer.len() == capacity {
            let dropped = channel.buffer.pop_front();
            if let Some(dropped) = dropped {
                log::warn!(
                    "event buffer full for session {}; dropping oldest {}",
                    session_id,
                    dropped.event_type.as_str()
                );
            }
        }
        channel.buffer.push_back(event.clone());

        // send() errs only when there are no subscribers, which is fine.
        let _ = channel.sender.send(event);
        Ok(())
    }

    async fn stream(&self, session_id: &str) -> EventStream {
        let mut sessions = self.sessions.write().await;
        let capacity = self.capacity;
        let channel = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionChannel {
                sender: broadcast::channel(capacity).0,
                buffer: VecDeque::with_capacity(capacity),
            });

        let session = session_id.to_string();
        let receiver = channel.sender.subscribe();
        Box::pin(
            BroadcastStream::new(receiver).filter_map(move |item| {
                let session = session.clone();
                async move {
                    match item {
                        Ok(event) => Some(event),
                        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                            log::warn!(
                                "subscriber_lagging: session {} subscriber skipped {} events",
                                session,
                                skipped
                            );
                            None
                        }
                    }
                }
            }),
        )
    }

    fn backend_name(&self) -> &str {
        "in_memory"
    }
}
