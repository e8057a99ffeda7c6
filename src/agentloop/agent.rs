//! Agent
//!
//! An [`Agent`] binds a name and system instruction to an LLM adapter, a
//! memory router, an event router, a local tool registry, and any number of
//! remote tool-server sessions.  Each call to [`run`](Agent::run) drives
//! one query through a fresh [`ReactEngine`](crate::react::ReactEngine)
//! against a session.
//!
//! All collaborators are explicit values passed at construction — there are
//! no globals and no hidden registries.  Stores are shared through `Arc`, so
//! several agents can collaborate on the same memory and event backends.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentloop::agent::Agent;
//! use agentloop::config::AgentConfig;
//! use agentloop::llm::{LLMAdapter, LLMError, LLMResponse, Message, ToolDefinition};
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct MyProvider;
//!
//! #[async_trait]
//! impl LLMAdapter for MyProvider {
//!     async fn complete(
//!         &self,
//!         _messages: &[Message],
//!         _tools: Option<Vec<ToolDefinition>>,
//!     ) -> Result<LLMResponse, LLMError> {
//!         Ok(LLMResponse { content: "Final Answer: done".into(), usage: None })
//!     }
//!     fn model_name(&self) -> &str { "my-model" }
//! }
//!
//! # async {
//! let agent = Agent::new("assistant", "You are a helpful assistant.", Arc::new(MyProvider))
//!     .with_config(AgentConfig::new("assistant"));
//!
//! let result = agent.run("hello", None).await;
//! assert_eq!(result.response, "done");
//! # };
//! ```

use crate::agentloop::config::AgentConfig;
use crate::agentloop::events::{EventRouter, EventStore, EventStream, InMemoryEventStore};
use crate::agentloop::llm::LLMAdapter;
use crate::agentloop::memory::{InMemoryStore, MemoryError, MemoryRouter, MemoryStore, StoredMessage};
use crate::agentloop::parser::ParserKind;
use crate::agentloop::prompt::PromptBuilder;
use crate::agentloop::react::{AgentState, ReactEngine, RunResources};
use crate::agentloop::tool_protocol::ToolRegistry;
use crate::agentloop::tool_server::{
    discover_remote_tools, RemoteToolCatalog, ToolServerConnector, ToolServerSession,
};
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use tokio::sync::watch;

/// What one [`Agent::run`] call produced.
#[derive(Debug, Clone)]
pub struct AgentRunResult {
    /// The final answer, limit message, max-steps message, or error text.
    pub response: String,
    /// The session the run executed against (generated when not supplied).
    pub session_id: String,
    /// Name of the agent that ran.
    pub agent_name: String,
    /// Whether the run ended in an unrecoverable error (the response is an
    /// error description).  Limit and max-steps endings are not failures.
    pub failed: bool,
}

/// An LLM agent with explicit collaborators and per-run ReAct execution.
pub struct Agent {
    name: String,
    system_instruction: String,
    llm: Arc<dyn LLMAdapter>,
    memory: Arc<MemoryRouter>,
    events: Arc<EventRouter>,
    local_tools: Arc<ToolRegistry>,
    sessions: HashMap<String, Arc<dyn ToolServerSession>>,
    remote_catalog: RemoteToolCatalog,
    config: AgentConfig,
    parser: ParserKind,
}

impl Agent {
    /// Create an agent with in-memory stores, an empty tool registry, the
    /// JSON parser, and a default [`AgentConfig`] named after the agent.
    pub fn new(
        name: impl Into<String>,
        system_instruction: impl Into<String>,
        llm: Arc<dyn LLMAdapter>,
    ) -> Self {
        let name = name.into();
        Self {
            config: AgentConfig::new(&name),
            name,
            system_instruction: system_instruction.into(),
            llm,
            memory: Arc::new(MemoryRouter::new(Arc::new(InMemoryStore::new()))),
            events: Arc::new(EventRouter::new(Arc::new(InMemoryEventStore::default()))),
            local_tools: Arc::new(ToolRegistry::new()),
            sessions: HashMap::new(),
            remote_catalog: RemoteToolCatalog::new(),
            parser: ParserKind::Json,
        }
    }

    /// Use a shared memory router (builder pattern).
    pub fn with_memory(mut self, memory: Arc<MemoryRouter>) -> Self {
        self.memory = memory;
        self
    }

    /// Use a shared event router (builder pattern).
    pub fn with_events(mut self, events: Arc<EventRouter>) -> Self {
        self.events = events;
        self
    }

    /// Grant the agent a registry of local tools (builder pattern).
    ///
    /// The registry is shared via `Arc`, so tools registered later are
    /// visible to runs already configured with it.
    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.local_tools = tools;
        self
    }

    /// Replace the agent configuration (builder pattern).  The config's
    /// `agent_name` is overwritten with this agent's name.
    pub fn with_config(mut self, mut config: AgentConfig) -> Self {
        config.agent_name = self.name.clone();
        self.config = config;
        self
    }

    /// Choose the response grammar (builder pattern).  The matching prompt
    /// suffix is selected automatically.
    pub fn with_parser(mut self, parser: ParserKind) -> Self {
        self.parser = parser;
        self
    }

    /// Connect a remote tool server and add its tools to the catalog.
    ///
    /// The connector establishes a session; the session's tools are
    /// discovered immediately so they appear in the next run's prompt.
    pub async fn connect_tool_server(
        &mut self,
        server_name: impl Into<String>,
        connector: &dyn ToolServerConnector,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let session = connector.connect().await?;
        self.add_tool_session(server_name, session).await
    }

    /// Register an already-established tool-server session.
    pub async fn add_tool_session(
        &mut self,
        server_name: impl Into<String>,
        session: Arc<dyn ToolServerSession>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let server_name = server_name.into();
        let tools = session.list_tools().await?;
        log::info!(
            "agent {} connected to tool server {} ({} tools)",
            self.name,
            server_name,
            tools.len()
        );
        self.remote_catalog.insert(server_name.clone(), tools);
        self.sessions.insert(server_name, session);
        Ok(())
    }

    /// Re-discover the tool catalogs of all connected servers.
    pub async fn refresh_remote_catalog(&mut self) {
        self.remote_catalog = discover_remote_tools(&self.sessions).await;
    }

    /// Stable agent name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The active configuration.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// The event router runs report into; share it to observe the agent.
    pub fn events(&self) -> &Arc<EventRouter> {
        &self.events
    }

    /// The memory router sessions persist into.
    pub fn memory(&self) -> &Arc<MemoryRouter> {
        &self.memory
    }

    /// Generate a fresh session id for this agent.
    pub fn generate_session_id(&self) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}_{}", self.name, &suffix[..8])
    }

    /// Run one query.  A missing `session_id` gets a generated one, returned
    /// in the result for continuity.
    pub async fn run(&self, query: &str, session_id: Option<String>) -> AgentRunResult {
        self.run_with_cancel(query, session_id, None).await
    }

    /// Run one query with a cancellation signal.  Flipping the watch value
    /// to `true` interrupts the run at its next suspension point.
    pub async fn run_with_cancel(
        &self,
        query: &str,
        session_id: Option<String>,
        cancel: Option<watch::Receiver<bool>>,
    ) -> AgentRunResult {
        let session_id = session_id.unwrap_or_else(|| self.generate_session_id());

        // The agent's retention policy applies to every read in this run.
        self.memory
            .apply_memory_config(&self.config.memory_config)
            .await;

        let local_tools = self.local_tools.list().await;
        let system_prompt = match self.parser {
            ParserKind::Json => PromptBuilder::new(),
            ParserKind::Xml => PromptBuilder::xml(),
        }
        .build(&self.system_instruction, &local_tools, &self.remote_catalog);

        let resources = RunResources {
            llm: &self.llm,
            memory: &self.memory,
            events: &self.events,
            local_tools: &self.local_tools,
            sessions: &self.sessions,
            remote_catalog: &self.remote_catalog,
        };

        let mut engine = ReactEngine::new(self.config.clone(), self.parser);
        let response = engine
            .run(&system_prompt, query, &resources, &session_id, cancel)
            .await;
        let failed = engine.state() == AgentState::Error;

        AgentRunResult {
            response,
            session_id,
            agent_name: self.name.clone(),
            failed,
        }
    }

    /// Subscribe to this agent's events for one session.
    pub async fn stream_events(&self, session_id: &str) -> EventStream {
        self.events.stream(session_id).await
    }

    /// The persisted history of one session, filtered to this agent.
    pub async fn get_session_history(
        &self,
        session_id: &str,
    ) -> Result<Vec<StoredMessage>, MemoryError> {
        self.memory.get_messages(session_id, Some(&self.name)).await
    }

    /// Clear one session's history (or every session this agent touched).
    pub async fn clear_session_history(
        &self,
        session_id: Option<&str>,
    ) -> Result<(), MemoryError> {
        self.memory.clear_memory(session_id, Some(&self.name)).await
    }
}
