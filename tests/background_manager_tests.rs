use agentloop::background::{
    BackgroundAgentConfig, BackgroundAgentManager, BackgroundAgentState, Schedule,
};
use agentloop::config::AgentConfig;
use agentloop::events::{EventRouter, EventType, InMemoryEventStore};
use agentloop::llm::{LLMAdapter, LLMError, LLMResponse, Message, ToolDefinition};
use agentloop::Agent;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Adapter that tracks how many completions are in flight at once and
/// holds each one open briefly, so overlapping runs would be visible.
struct GaugedClient {
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    hold: Duration,
    fail: bool,
}

#[async_trait]
impl LLMAdapter for GaugedClient {
    async fn complete(
        &self,
        _messages: &[Message],
        _tools: Option<Vec<ToolDefinition>>,
    ) -> Result<LLMResponse, LLMError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.fail {
            Err(LLMError::Provider("scripted failure".to_string()))
        } else {
            Ok(LLMResponse {
                content: "Final Answer: tick".to_string(),
                usage: None,
            })
        }
    }

    fn model_name(&self) -> &str {
        "gauged"
    }
}

fn worker(
    name: &str,
    hold: Duration,
    fail: bool,
    max_in_flight: Arc<AtomicUsize>,
) -> (Agent, Arc<InMemoryEventStore>) {
    let store = Arc::new(InMemoryEventStore::default());
    let events = Arc::new(EventRouter::new(store.clone()));
    let agent = Agent::new(
        name,
        "You are a background worker.",
        Arc::new(GaugedClient {
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight,
            hold,
            fail,
        }),
    )
    .with_events(events)
    .with_config(AgentConfig::new(name));
    (agent, store)
}

fn config(agent_id: &str, schedule: Schedule) -> BackgroundAgentConfig {
    BackgroundAgentConfig {
        agent_id: agent_id.to_string(),
        schedule,
        query: "do one round".to_string(),
        max_retries: 2,
        retry_delay: 1,
    }
}

#[tokio::test]
async fn interval_agents_run_repeatedly_without_overlap() {
    let _ = env_logger::builder().is_test(true).try_init();
    let manager = BackgroundAgentManager::new();

    let fast_gauge = Arc::new(AtomicUsize::new(0));
    let slow_gauge = Arc::new(AtomicUsize::new(0));
    // The slow agent's run (80 ms) outlasts its own interval (40 ms), so
    // ticks must be skipped rather than stacked.
    let (fast, fast_store) = worker("fast", Duration::from_millis(5), false, fast_gauge.clone());
    let (slow, _) = worker("slow", Duration::from_millis(80), false, slow_gauge.clone());

    let fast_created = manager
        .create_agent(fast, config("fast", Schedule::Interval(Duration::from_millis(50))))
        .await
        .unwrap();
    manager
        .create_agent(slow, config("slow", Schedule::Interval(Duration::from_millis(40))))
        .await
        .unwrap();

    manager.start("fast").await.unwrap();
    manager.start("slow").await.unwrap();
    tokio::time::sleep(Duration::from_millis(450)).await;
    manager.shutdown(Duration::from_secs(2)).await;

    let fast_status = manager.get_status("fast").await.unwrap();
    let slow_status = manager.get_status("slow").await.unwrap();

    assert!(fast_status.run_count >= 2, "fast ran {} times", fast_status.run_count);
    assert!(slow_status.run_count >= 1, "slow ran {} times", slow_status.run_count);

    // Never more than one run in flight per agent.
    assert!(fast_gauge.load(Ordering::SeqCst) <= 1);
    assert!(slow_gauge.load(Ordering::SeqCst) <= 1);

    // Every run emitted a matched started/finished pair on the stable
    // manager session.
    let events = fast_store.recent(&fast_created.session_id).await;
    let started = events
        .iter()
        .filter(|e| e.event_type == EventType::AgentStarted)
        .count();
    let finished = events
        .iter()
        .filter(|e| e.event_type == EventType::AgentFinished)
        .count();
    assert_eq!(started, fast_status.run_count);
    assert_eq!(finished, fast_status.run_count);
}

#[tokio::test]
async fn retries_then_pauses_after_exhaustion() {
    let manager = BackgroundAgentManager::new();
    let gauge = Arc::new(AtomicUsize::new(0));
    let (agent, store) = worker("flaky", Duration::from_millis(1), true, gauge);

    let created = manager
        .create_agent(
            agent,
            BackgroundAgentConfig {
                agent_id: "flaky".to_string(),
                schedule: Schedule::Interval(Duration::from_millis(30)),
                query: "try something".to_string(),
                max_retries: 2,
                retry_delay: 0,
            },
        )
        .await
        .unwrap();
    manager.start("flaky").await.unwrap();

    // Wait for the retries to exhaust and the agent to pause itself.
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if manager.get_status("flaky").await.unwrap().state == BackgroundAgentState::Paused {
            break;
        }
    }
    let status = manager.get_status("flaky").await.unwrap();
    assert_eq!(status.state, BackgroundAgentState::Paused);
    assert_eq!(status.error_count, 2);
    assert!(status.last_error.is_some());

    let events = store.recent(&created.session_id).await;
    assert!(events.iter().any(|e| {
        e.event_type == EventType::AgentError
            && e.payload["reason"] == serde_json::json!("retry_exhausted")
    }));

    manager.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn shutdown_rejects_new_starts() {
    let manager = BackgroundAgentManager::new();
    let gauge = Arc::new(AtomicUsize::new(0));
    let (agent, _) = worker("late", Duration::from_millis(1), false, gauge);
    manager
        .create_agent(agent, config("late", Schedule::Immediate))
        .await
        .unwrap();

    manager.shutdown(Duration::from_millis(100)).await;
    assert!(manager.start("late").await.is_err());
}
