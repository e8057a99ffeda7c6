//! Redis-streams event store.
//!
//! One stream per session (`agentloop:events:<session_id>`).  `append` is an
//! `XADD`; `stream` spawns a polling task that blocks on `XREAD` from the
//! last-seen id and forwards entries into a channel.  Retention is the
//! remote system's concern.

use super::{Event, EventError, EventStore, EventStream};
use async_trait::async_trait;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

fn stream_key(session_id: &str) -> String {
    format!("agentloop:events:{}", session_id)
}

/// Event store backed by one redis stream per session.
pub struct RedisStreamEventStore {
    connection: redis::aio::MultiplexedConnection,
}

impl RedisStreamEventStore {
    /// Connect to `redis://host:port[/db]`.
    pub async fn connect(url: &str) -> Result<Self, EventError> {
        let client = redis::Client::open(url).map_err(|e| EventError::Backend(e.to_string()))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| EventError::Backend(e.to_string()))?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl EventStore for RedisStreamEventStore {
    async fn append(&self, session_id: &str, event: Event) -> Result<(), EventError> {
        let encoded =
            serde_json::to_string(&event).map_err(|e| EventError::Serialization(e.to_string()))?;
        let mut con = self.connection.clone();
        let _: String = con
            .xadd(stream_key(session_id), "*", &[("event", encoded)])
            .await
            .map_err(|e| EventError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn stream(&self, session_id: &str) -> EventStream {
        let (tx, rx) = mpsc::channel::<Event>(super::DEFAULT_EVENT_CAPACITY);
        let mut con = self.connection.clone();
        let key = stream_key(session_id);
        let session = session_id.to_string();

        tokio::spawn(async move {
            // "$" = only entries added after this subscription.
            let mut last_id = "$".to_string();
            loop {
                let options = StreamReadOptions::default().block(1_000).count(100);
                let reply: Result<StreamReadReply, _> = con
                    .xread_options(&[&key], &[&last_id], &options)
                    .await;
                let reply = match reply {
                    Ok(reply) => reply,
                    Err(e) => {
                        log::error!("event stream read failed for session {}: {}", session, e);
                        break;
                    }
                };
                for stream in reply.keys {
                    for entry in stream.ids {
                        last_id = entry.id.clone();
                        let raw: Option<String> = entry.get("event");
                        let event = match raw.as_deref().map(serde_json::from_str::<Event>) {
                            Some(Ok(event)) => event,
                            _ => {
                                log::warn!(
                                    "skipping undecodable event {} in session {}",
                                    entry.id,
                                    session
                                );
                                continue;
                            }
                        };
                        if tx.send(event).await.is_err() {
                            // Subscriber dropped the stream; stop polling.
                            return;
                        }
                    }
                }
            }
        });

        Box::pin(ReceiverStream::new(rx))
    }

    fn backend_name(&self) -> &str {
        "redis_stream"
    }
}

// Live-service tests: run against a local redis with
// `cargo test --features redis-backend -- --ignored`.
// Override the target with AGENTLOOP_TEST_REDIS_URL.
#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentloop::events::EventType;
    use futures_util::StreamExt;
    use std::time::Duration;

    fn test_url() -> String {
        std::env::var("AGENTLOOP_TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    fn session() -> String {
        format!("test_{}", uuid::Uuid::new_v4().simple())
    }

    #[tokio::test]
    #[ignore]
    async fn subscribers_receive_appended_events_in_order() {
        let store = RedisStreamEventStore::connect(&test_url()).await.unwrap();
        let sid = session();

        let mut stream = store.stream(&sid).await;
        // Let the polling task park on the stream before producing.
        tokio::time::sleep(Duration::from_millis(200)).await;

        store
            .append(
                &sid,
                Event::new(EventType::AgentStarted, &sid, "tester", serde_json::json!({})),
            )
            .await
            .unwrap();
        store
            .append(
                &sid,
                Event::new(
                    EventType::AgentFinished,
                    &sid,
                    "tester",
                    serde_json::json!({"reason": "completed"}),
                ),
            )
            .await
            .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.event_type, EventType::AgentStarted);
        assert_eq!(first.session_id, sid);

        let second = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.event_type, EventType::AgentFinished);
        assert_eq!(second.payload["reason"], serde_json::json!("completed"));
    }

    #[tokio::test]
    #[ignore]
    async fn subscription_is_live_only() {
        let store = RedisStreamEventStore::connect(&test_url()).await.unwrap();
        let sid = session();

        // Appended before anyone subscribes; must not be replayed.
        store
            .append(
                &sid,
                Event::new(EventType::AgentStarted, &sid, "tester", serde_json::json!({})),
            )
            .await
            .unwrap();

        let mut stream = store.stream(&sid).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        store
            .append(
                &sid,
                Event::new(EventType::FinalAnswer, &sid, "tester", serde_json::json!({})),
            )
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.event_type, EventType::FinalAnswer);
    }
}
