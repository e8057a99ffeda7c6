//! Background Agent Manager
//!
//! Supervises long-lived agents that run on a schedule.  The manager owns a
//! set of [`Agent`]s, drives their [`run`](Agent::run) calls from per-agent
//! tickers, and bounds total concurrency with a global worker pool.
//!
//! # Concurrency
//!
//! - At most one run per agent is in flight.  A tick that fires while the
//!   previous run is still active is **skipped**, not queued.
//! - A global semaphore (default 4 permits) limits concurrent runs across
//!   all agents.
//!
//! # Failure handling
//!
//! A failed run increments the agent's error count.  While the count stays
//! below `max_retries`, the next run is scheduled after `retry_delay`
//! seconds, overriding the normal interval once.  When retries are
//! exhausted consecutively, the agent transitions to `paused` and an
//! `agent_error` event with `reason = "retry_exhausted"` is emitted.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentloop::background::{BackgroundAgentConfig, BackgroundAgentManager, Schedule};
//! # use agentloop::agent::Agent;
//! # use std::sync::Arc;
//!
//! # async fn demo(agent: Agent) {
//! let manager = BackgroundAgentManager::new();
//! let created = manager
//!     .create_agent(
//!         agent,
//!         BackgroundAgentConfig {
//!             agent_id: "monitor".into(),
//!             schedule: Schedule::Interval(std::time::Duration::from_secs(60)),
//!             query: "Check the service status and report anomalies.".into(),
//!             max_retries: 3,
//!             retry_delay: 10,
//!         },
//!     )
//!     .await;
//! manager.start("monitor").await.unwrap();
//! # let _ = created;
//! # }
//! ```

use crate::agentloop::agent::Agent;
use crate::agentloop::events::{Event, EventStore, EventStream, EventType};
use serde_json::json;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;

/// Default size of the global worker pool.
pub const DEFAULT_WORKER_POOL: usize = 4;

/// When a background agent runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Run once as soon as the agent is started.
    Immediate,
    /// Run repeatedly at this interval.
    Interval(Duration),
}

/// Lifecycle state of a background agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundAgentState {
    Created,
    Scheduled,
    Running,
    Paused,
    Stopped,
}

impl BackgroundAgentState {
    /// Lower-case tag used in status output.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackgroundAgentState::Created => "created",
            BackgroundAgentState::Scheduled => "scheduled",
            BackgroundAgentState::Running => "running",
            BackgroundAgentState::Paused => "paused",
            BackgroundAgentState::Stopped => "stopped",
        }
    }
}

/// Configuration for one background agent.
#[derive(Debug, Clone)]
pub struct BackgroundAgentConfig {
    /// Unique id within the manager.
    pub agent_id: String,
    /// When the agent runs.
    pub schedule: Schedule,
    /// The query submitted on every run (hot-swappable via
    /// [`BackgroundAgentManager::update_task`]).
    pub query: String,
    /// Consecutive failures tolerated before the agent is paused.
    pub max_retries: usize,
    /// Seconds to wait before retrying after a failure.
    pub retry_delay: u64,
}

/// Status snapshot returned by [`BackgroundAgentManager::get_status`].
#[derive(Debug, Clone)]
pub struct BackgroundAgentStatus {
    pub agent_id: String,
    pub session_id: String,
    pub state: BackgroundAgentState,
    pub is_running: bool,
    pub run_count: usize,
    pub error_count: usize,
    pub last_run: Option<chrono::DateTime<chrono::Utc>>,
    pub last_error: Option<String>,
    pub task_query: String,
}

/// Result of [`BackgroundAgentManager::create_agent`].
#[derive(Debug, Clone)]
pub struct CreatedAgent {
    pub agent_id: String,
    /// Manager-generated session id, stable across this agent's runs.
    pub session_id: String,
}

/// Errors surfaced by manager operations.
#[derive(Debug, Clone)]
pub enum ManagerError {
    /// No agent with this id exists.
    AgentNotFound(String),
    /// An agent with this id already exists.
    DuplicateAgent(String),
    /// The operation is not valid in the agent's current state.
    InvalidState(String),
    /// The manager is shutting down.
    ShuttingDown,
}

impl fmt::Display for ManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerError::AgentNotFound(id) => write!(f, "Background agent not found: {}", id),
            ManagerError::DuplicateAgent(id) => {
                write!(f, "Background agent already exists: {}", id)
            }
            ManagerError::InvalidState(msg) => write!(f, "Invalid agent state: {}", msg),
            ManagerError::ShuttingDown => write!(f, "Manager is shutting down"),
        }
    }
}

impl Error for ManagerError {}

struct BackgroundAgent {
    agent: Arc<Agent>,
    config: BackgroundAgentConfig,
    session_id: String,
    state: BackgroundAgentState,
    is_running: bool,
    run_count: usize,
    error_count: usize,
    last_run: Option<chrono::DateTime<chrono::Utc>>,
    last_error: Option<String>,
    /// One-shot interval override after a failed run.
    retry_pending: bool,
    ticker: Option<JoinHandle<()>>,
}

impl BackgroundAgent {
    fn status(&self) -> BackgroundAgentStatus {
        BackgroundAgentStatus {
            agent_id: self.config.agent_id.clone(),
            session_id: self.session_id.clone(),
            state: self.state,
            is_running: self.is_running,
            run_count: self.run_count,
            error_count: self.error_count,
            last_run: self.last_run,
            last_error: self.last_error.clone(),
            task_query: self.config.query.clone(),
        }
    }
}

/// Owns background agents and drives their schedules.
pub struct BackgroundAgentManager {
    agents: Arc<RwLock<HashMap<String, Arc<Mutex<BackgroundAgent>>>>>,
    worker_pool: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
}

impl Default for BackgroundAgentManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BackgroundAgentManager {
    /// Manager with the default worker pool of [`DEFAULT_WORKER_POOL`].
    pub fn new() -> Self {
        Self::with_worker_pool(DEFAULT_WORKER_POOL)
    }

    /// Manager with an explicit worker-pool size.
    pub fn with_worker_pool(workers: usize) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            agents: Arc::new(RwLock::new(HashMap::new())),
            worker_pool: Arc::new(Semaphore::new(workers.max(1))),
            shutdown_tx,
        }
    }

    /// Register an agent under the manager.  The returned session id is
    /// generated once and reused for every run of this agent.
    pub async fn create_agent(
        &self,
        agent: Agent,
        config: BackgroundAgentConfig,
    ) -> Result<CreatedAgent, ManagerError> {
        let mut agents = self.agents.write().await;
        if agents.contains_key(&config.agent_id) {
            return Err(ManagerError::DuplicateAgent(config.agent_id));
        }
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let session_id = format!("{}_{}", config.agent_id, &suffix[..8]);
        let agent_id = config.agent_id.clone();
        let record = BackgroundAgent {
            agent: Arc::new(agent),
            config,
            session_id: session_id.clone(),
            state: BackgroundAgentState::Created,
            is_running: false,
            run_count: 0,
            error_count: 0,
            last_run: None,
            last_error: None,
            retry_pending: false,
            ticker: None,
        };
        agents.insert(agent_id.clone(), Arc::new(Mutex::new(record)));
        log::info!("background agent {} created (session {})", agent_id, session_id);
        Ok(CreatedAgent {
            agent_id,
            session_id,
        })
    }

    async fn record(&self, agent_id: &str) -> Result<Arc<Mutex<BackgroundAgent>>, ManagerError> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| ManagerError::AgentNotFound(agent_id.to_string()))
    }

    /// Start an agent's ticker.  Valid from `created` or `stopped`.
    pub async fn start(&self, agent_id: &str) -> Result<(), ManagerError> {
        if *self.shutdown_tx.borrow() {
            return Err(ManagerError::ShuttingDown);
        }
        let record = self.record(agent_id).await?;
        let mut guard = record.lock().await;
        match guard.state {
            BackgroundAgentState::Created | BackgroundAgentState::Stopped => {}
            other => {
                return Err(ManagerError::InvalidState(format!(
                    "cannot start agent {} from state {}",
                    agent_id,
                    other.as_str()
                )));
            }
        }
        guard.state = BackgroundAgentState::Scheduled;
        let handle = self.spawn_ticker(agent_id.to_string(), record.clone());
        guard.ticker = Some(handle);
        log::info!("background agent {} started", agent_id);
        Ok(())
    }

    fn spawn_ticker(
        &self,
        agent_id: String,
        record: Arc<Mutex<BackgroundAgent>>,
    ) -> JoinHandle<()> {
        let worker_pool = self.worker_pool.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let cancel_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let schedule = {
                let guard = record.lock().await;
                guard.config.schedule
            };

            loop {
                // Pick the delay for this cycle: retry override, interval,
                // or none for an immediate one-shot.
                let delay = {
                    let guard = record.lock().await;
                    if guard.state == BackgroundAgentState::Stopped {
                        break;
                    }
                    if guard.retry_pending {
                        Some(Duration::from_secs(guard.config.retry_delay))
                    } else {
                        match schedule {
                            Schedule::Immediate => None,
                            Schedule::Interval(interval) => Some(interval),
                        }
                    }
                };

                if let Some(delay) = delay {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.changed() => {}
                    }
                }
                if *shutdown_rx.borrow() {
                    break;
                }

                // Claim the tick.  Paused agents and in-flight runs collapse
                // the tick (skipped, not queued).
                let claimed = {
                    let mut guard = record.lock().await;
                    if guard.state == BackgroundAgentState::Stopped {
                        break;
                    }
                    if guard.state != BackgroundAgentState::Scheduled || guard.is_running {
                        false
                    } else {
                        guard.is_running = true;
                        guard.state = BackgroundAgentState::Running;
                        guard.retry_pending = false;
                        true
                    }
                };
                if !claimed {
                    if schedule == Schedule::Immediate {
                        break;
                    }
                    continue;
                }

                let (agent, query, session_id) = {
                    let guard = record.lock().await;
                    (
                        guard.agent.clone(),
                        guard.config.query.clone(),
                        guard.session_id.clone(),
                    )
                };

                let permit = match worker_pool.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                log::debug!("background agent {} run starting", agent_id);
                let result = agent
                    .run_with_cancel(&query, Some(session_id.clone()), Some(cancel_rx.clone()))
                    .await;
                drop(permit);

                // Bookkeeping and retry policy.
                let mut guard = record.lock().await;
                guard.is_running = false;
                guard.run_count += 1;
                guard.last_run = Some(chrono::Utc::now());
                if guard.state == BackgroundAgentState::Running {
                    guard.state = BackgroundAgentState::Scheduled;
                }

                if result.failed {
                    guard.error_count += 1;
                    guard.last_error = Some(result.response.clone());
                    log::warn!(
                        "background agent {} run failed ({}/{} retries): {}",
                        agent_id,
                        guard.error_count,
                        guard.config.max_retries,
                        result.response
                    );
                    if guard.error_count < guard.config.max_retries {
                        guard.retry_pending = true;
                    } else {
                        guard.state = BackgroundAgentState::Paused;
                        let event = Event::new(
                            EventType::AgentError,
                            &session_id,
                            agent.name(),
                            json!({
                                "reason": "retry_exhausted",
                                "error_count": guard.error_count,
                            }),
                        );
                        if let Err(e) = agent.events().append(&session_id, event).await {
                            log::error!("failed to emit retry_exhausted event: {}", e);
                        }
                        log::error!(
                            "background agent {} paused after {} consecutive failures",
                            agent_id,
                            guard.error_count
                        );
                    }
                } else {
                    guard.error_count = 0;
                    guard.last_error = None;
                }
                drop(guard);

                if schedule == Schedule::Immediate {
                    break;
                }
            }
            log::debug!("background agent {} ticker exited", agent_id);
        })
    }

    /// Pause an agent: its ticks are skipped until [`resume`](Self::resume).
    pub async fn pause(&self, agent_id: &str) -> Result<(), ManagerError> {
        let record = self.record(agent_id).await?;
        let mut guard = record.lock().await;
        guard.state = BackgroundAgentState::Paused;
        log::info!("background agent {} paused", agent_id);
        Ok(())
    }

    /// Resume a paused agent.  Clears the error count.
    pub async fn resume(&self, agent_id: &str) -> Result<(), ManagerError> {
        let record = self.record(agent_id).await?;
        let mut guard = record.lock().await;
        if guard.state != BackgroundAgentState::Paused {
            return Err(ManagerError::InvalidState(format!(
                "agent {} is not paused",
                agent_id
            )));
        }
        guard.state = BackgroundAgentState::Scheduled;
        guard.error_count = 0;
        log::info!("background agent {} resumed", agent_id);
        Ok(())
    }

    /// Stop and remove an agent.  Its ticker is aborted; an in-flight run is
    /// cancelled at its next suspension point.
    pub async fn remove(&self, agent_id: &str) -> Result<(), ManagerError> {
        let record = {
            let mut agents = self.agents.write().await;
            agents
                .remove(agent_id)
                .ok_or_else(|| ManagerError::AgentNotFound(agent_id.to_string()))?
        };
        let mut guard = record.lock().await;
        guard.state = BackgroundAgentState::Stopped;
        if let Some(ticker) = guard.ticker.take() {
            ticker.abort();
        }
        log::info!("background agent {} removed", agent_id);
        Ok(())
    }

    /// Hot-swap the query used from the next tick onward.
    pub async fn update_task(&self, agent_id: &str, query: impl Into<String>) -> Result<(), ManagerError> {
        let record = self.record(agent_id).await?;
        let mut guard = record.lock().await;
        guard.config.query = query.into();
        Ok(())
    }

    /// The query an agent currently runs.
    pub async fn get_task(&self, agent_id: &str) -> Result<String, ManagerError> {
        let record = self.record(agent_id).await?;
        let guard = record.lock().await;
        Ok(guard.config.query.clone())
    }

    /// Status snapshots for every registered agent.
    pub async fn list_agents(&self) -> Vec<BackgroundAgentStatus> {
        let agents = self.agents.read().await;
        let mut statuses = Vec::with_capacity(agents.len());
        for record in agents.values() {
            statuses.push(record.lock().await.status());
        }
        statuses.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        statuses
    }

    /// Status snapshot for one agent.
    pub async fn get_status(&self, agent_id: &str) -> Result<BackgroundAgentStatus, ManagerError> {
        let record = self.record(agent_id).await?;
        let guard = record.lock().await;
        Ok(guard.status())
    }

    /// Subscribe to the event stream bound to an agent's manager-generated
    /// session.
    pub async fn stream_events(&self, agent_id: &str) -> Result<EventStream, ManagerError> {
        let record = self.record(agent_id).await?;
        let (agent, session_id) = {
            let guard = record.lock().await;
            (guard.agent.clone(), guard.session_id.clone())
        };
        Ok(agent.stream_events(&session_id).await)
    }

    /// Shut the manager down: new ticks are rejected, in-flight runs get
    /// `grace` to finish, then their cancellation signal fires at the next
    /// suspension point.
    pub async fn shutdown(&self, grace: Duration) {
        log::info!("background manager shutting down");
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let mut any_running = false;
            {
                let agents = self.agents.read().await;
                for record in agents.values() {
                    if record.lock().await.is_running {
                        any_running = true;
                        break;
                    }
                }
            }
            if !any_running || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let agents = self.agents.read().await;
        for record in agents.values() {
            let mut guard = record.lock().await;
            guard.state = BackgroundAgentState::Stopped;
            if let Some(ticker) = guard.ticker.take() {
                ticker.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentloop::llm::{LLMAdapter, LLMError, LLMResponse, Message, ToolDefinition};
    use async_trait::async_trait;

    struct AnswerClient;

    #[async_trait]
    impl LLMAdapter for AnswerClient {
        async fn complete(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<ToolDefinition>>,
        ) -> Result<LLMResponse, LLMError> {
            Ok(LLMResponse {
                content: "Final Answer: ok".to_string(),
                usage: None,
            })
        }

        fn model_name(&self) -> &str {
            "answer"
        }
    }

    fn agent(name: &str) -> Agent {
        Agent::new(name, "You are a background worker.", Arc::new(AnswerClient))
    }

    fn config(agent_id: &str, schedule: Schedule) -> BackgroundAgentConfig {
        BackgroundAgentConfig {
            agent_id: agent_id.to_string(),
            schedule,
            query: "do the rounds".to_string(),
            max_retries: 3,
            retry_delay: 1,
        }
    }

    #[tokio::test]
    async fn create_assigns_a_stable_session_id() {
        let manager = BackgroundAgentManager::new();
        let created = manager
            .create_agent(agent("worker"), config("worker", Schedule::Immediate))
            .await
            .unwrap();
        assert!(created.session_id.starts_with("worker_"));

        let status = manager.get_status("worker").await.unwrap();
        assert_eq!(status.session_id, created.session_id);
        assert_eq!(status.state, BackgroundAgentState::Created);
        assert_eq!(status.run_count, 0);
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let manager = BackgroundAgentManager::new();
        manager
            .create_agent(agent("w"), config("w", Schedule::Immediate))
            .await
            .unwrap();
        let err = manager
            .create_agent(agent("w"), config("w", Schedule::Immediate))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::DuplicateAgent(_)));
    }

    #[tokio::test]
    async fn immediate_schedule_runs_once() {
        let manager = BackgroundAgentManager::new();
        manager
            .create_agent(agent("once"), config("once", Schedule::Immediate))
            .await
            .unwrap();
        manager.start("once").await.unwrap();

        // Give the single run time to complete.
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if manager.get_status("once").await.unwrap().run_count == 1 {
                break;
            }
        }
        let status = manager.get_status("once").await.unwrap();
        assert_eq!(status.run_count, 1);
        assert_eq!(status.error_count, 0);
        assert!(status.last_run.is_some());
    }

    #[tokio::test]
    async fn update_task_hot_swaps_the_query() {
        let manager = BackgroundAgentManager::new();
        manager
            .create_agent(agent("w"), config("w", Schedule::Immediate))
            .await
            .unwrap();
        manager.update_task("w", "new orders").await.unwrap();
        assert_eq!(manager.get_task("w").await.unwrap(), "new orders");
    }

    #[tokio::test]
    async fn pause_resume_and_remove() {
        let manager = BackgroundAgentManager::new();
        manager
            .create_agent(
                agent("w"),
                config("w", Schedule::Interval(Duration::from_secs(3600))),
            )
            .await
            .unwrap();
        manager.start("w").await.unwrap();
        manager.pause("w").await.unwrap();
        assert_eq!(
            manager.get_status("w").await.unwrap().state,
            BackgroundAgentState::Paused
        );
        manager.resume("w").await.unwrap();
        assert_eq!(
            manager.get_status("w").await.unwrap().state,
            BackgroundAgentState::Scheduled
        );
        manager.remove("w").await.unwrap();
        assert!(matches!(
            manager.get_status("w").await.unwrap_err(),
            ManagerError::AgentNotFound(_)
        ));
    }

    #[tokio::test]
    async fn start_twice_is_invalid() {
        let manager = BackgroundAgentManager::new();
        manager
            .create_agent(
                agent("w"),
                config("w", Schedule::Interval(Duration::from_secs(3600))),
            )
            .await
            .unwrap();
        manager.start("w").await.unwrap();
        assert!(matches!(
            manager.start("w").await.unwrap_err(),
            ManagerError::InvalidState(_)
        ));
    }
}
