//! ReAct Engine
//!
//! Drives one query through the think→act→observe loop.  The engine owns
//! the working-memory message list presented to the LLM, consults the
//! [`LoopDetector`](crate::loop_detector::LoopDetector) and
//! [`UsageLimits`](crate::usage::UsageLimits) every step, and persists and
//! emits everything significant along the way.
//!
//! # State machine
//!
//! ```text
//!        idle
//!          │ run()
//!          ▼
//!       running ──────────────┐
//!          │ parse → Answer    │
//!          ▼                   │
//!       finished (return)      │
//!          │ parse → Action    │
//!          ▼                   │
//!    tool_calling              │
//!          │ execute + observe │
//!          ▼                   │
//!       observing ─────────────┘  (loop back)
//!          │ loop detected
//!          ▼
//!         stuck ── corrective prompt, detector reset ──► running
//!          │ irrecoverable
//!          ▼
//!         error
//! ```
//!
//! # Ordering guarantees
//!
//! Within one run: persist user query → (per step) persist
//! assistant-with-tool-calls → execute tool → persist tool result → persist
//! observation user message → … → persist final assistant answer.  The
//! `final_answer` event fires after its message is persisted; tool events
//! fire after execution.
//!
//! A run always returns a string: the final answer, the limit message, the
//! max-steps message, or an error description.

use crate::agentloop::config::AgentConfig;
use crate::agentloop::dispatcher::{execute_with_timeout, resolve_tool_call};
use crate::agentloop::events::{Event, EventRouter, EventStore, EventType};
use crate::agentloop::llm::{LLMAdapter, Message, Role, ToolCallSpec};
use crate::agentloop::loop_detector::LoopDetector;
use crate::agentloop::memory::{MemoryRouter, MemoryStore, MessageMetadata, StoredMessage};
use crate::agentloop::parser::{decode_action, parse_response, ParsedResponse, ParserKind};
use crate::agentloop::prompt::stuck_prompt;
use crate::agentloop::tool_protocol::ToolRegistry;
use crate::agentloop::tool_server::{RemoteToolCatalog, ToolServerSession};
use crate::agentloop::usage::{Usage, UsageLimits};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Where a run currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Running,
    ToolCalling,
    Observing,
    Stuck,
    Finished,
    Error,
}

impl AgentState {
    /// Lower-case tag used in logs and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Running => "running",
            AgentState::ToolCalling => "tool_calling",
            AgentState::Observing => "observing",
            AgentState::Stuck => "stuck",
            AgentState::Finished => "finished",
            AgentState::Error => "error",
        }
    }
}

/// Consecutive loop detections that escalate a run to an error.
const MAX_STUCK_ESCALATIONS: usize = 3;

/// Collaborators a run executes against.  All are borrowed: the engine owns
/// no stores, no adapters, and no registries.
pub struct RunResources<'a> {
    /// The LLM adapter answering completions.
    pub llm: &'a Arc<dyn LLMAdapter>,
    /// Session message substrate.
    pub memory: &'a MemoryRouter,
    /// Lifecycle event sink.
    pub events: &'a EventRouter,
    /// Locally registered tools.
    pub local_tools: &'a Arc<ToolRegistry>,
    /// Connected remote tool-server sessions, by server name.
    pub sessions: &'a HashMap<String, Arc<dyn ToolServerSession>>,
    /// Remote tool catalog, by server name.
    pub remote_catalog: &'a RemoteToolCatalog,
}

/// The ReAct loop for one agent.  Create one engine per run.
pub struct ReactEngine {
    config: AgentConfig,
    parser: ParserKind,
    state: AgentState,
    messages: Vec<Message>,
    loop_detector: LoopDetector,
    usage: Usage,
    limits: UsageLimits,
}

impl ReactEngine {
    /// Build an engine from an agent's config and parser choice.
    pub fn new(config: AgentConfig, parser: ParserKind) -> Self {
        let limits = UsageLimits::new(config.request_limit, config.total_tokens_limit);
        let loop_detector = LoopDetector::new(config.loop_window_size, config.loop_repeat_threshold);
        Self {
            config,
            parser,
            state: AgentState::Idle,
            messages: Vec::new(),
            loop_detector,
            usage: Usage::default(),
            limits,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Usage counters accumulated so far in this run.
    pub fn usage(&self) -> Usage {
        self.usage
    }

    fn set_state(&mut self, state: AgentState) {
        log::debug!(
            "agent {} state: {} -> {}",
            self.config.agent_name,
            self.state.as_str(),
            state.as_str()
        );
        self.state = state;
    }

    async fn emit(
        &self,
        events: &EventRouter,
        session_id: &str,
        event_type: EventType,
        payload: serde_json::Value,
    ) {
        let event = Event::new(event_type, session_id, &self.config.agent_name, payload);
        // An event-store failure never aborts the run.
        if let Err(e) = events.append(session_id, event).await {
            log::error!(
                "event append failed for session {}: {}",
                session_id,
                e
            );
        }
    }

    /// Reconstruct working memory from the persisted session, enforcing the
    /// assistant-tool-block invariant:
    ///
    /// - an assistant message with tool calls is buffered together with its
    ///   following tool-role messages and flushed as a single block;
    /// - a user message or a plain assistant message flushes any pending
    ///   block first;
    /// - tool-role messages without a preceding buffered assistant are
    ///   dropped (they would be invalid per the LLM protocol).
    fn rehydrate(&mut self, stored: &[StoredMessage]) {
        let mut pending_assistant: Option<Message> = None;
        let mut pending_tools: Vec<Message> = Vec::new();

        fn flush(
            messages: &mut Vec<Message>,
            pending_assistant: &mut Option<Message>,
            pending_tools: &mut Vec<Message>,
        ) {
            if let Some(assistant) = pending_assistant.take() {
                messages.push(assistant);
                messages.append(pending_tools);
            }
            pending_tools.clear();
        }

        for message in stored {
            match message.role.as_str() {
                "user" => {
                    flush(&mut self.messages, &mut pending_assistant, &mut pending_tools);
                    self.messages
                        .push(Message::new(Role::User, message.content.clone()));
                }
                "assistant" if message.metadata.has_tool_calls => {
                    flush(&mut self.messages, &mut pending_assistant, &mut pending_tools);
                    pending_assistant = Some(Message {
                        role: Role::Assistant,
                        content: message.content.clone(),
                        tool_calls: message.metadata.tool_calls.clone(),
                    });
                }
                "assistant" => {
                    flush(&mut self.messages, &mut pending_assistant, &mut pending_tools);
                    self.messages
                        .push(Message::new(Role::Assistant, message.content.clone()));
                }
                "tool" => {
                    if pending_assistant.is_some() {
                        if let Some(call_id) = &message.metadata.tool_call_id {
                            pending_tools.push(Message::new(
                                Role::Tool {
                                    call_id: call_id.clone(),
                                },
                                message.content.clone(),
                            ));
                        }
                    }
                }
                "system" => {
                    self.messages
                        .push(Message::new(Role::System, message.content.clone()));
                }
                other => {
                    log::warn!("unknown message role in session history: {}", other);
                }
            }
        }
        flush(&mut self.messages, &mut pending_assistant, &mut pending_tools);
    }

    fn reset_system_prompt(&mut self, system_prompt: &str) {
        if let Some(first) = self.messages.first_mut() {
            if first.role == Role::System {
                first.content = system_prompt.to_string();
                return;
            }
        }
        self.messages
            .insert(0, Message::new(Role::System, system_prompt));
    }

    fn cancelled(cancel: &Option<watch::Receiver<bool>>) -> bool {
        cancel.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Persist a terminal assistant message so the session always ends with
    /// the text the run returned.
    async fn persist_terminal(
        &self,
        resources: &RunResources<'_>,
        session_id: &str,
        content: &str,
    ) {
        if let Err(e) = resources
            .memory
            .store_message(
                session_id,
                "assistant",
                content,
                MessageMetadata::for_agent(&self.config.agent_name),
            )
            .await
        {
            log::error!("failed to persist terminal message: {}", e);
        }
    }

    /// Execute one query against the session.  See the module docs for the
    /// state machine and ordering guarantees.
    pub async fn run(
        &mut self,
        system_prompt: &str,
        query: &str,
        resources: &RunResources<'_>,
        session_id: &str,
        cancel: Option<watch::Receiver<bool>>,
    ) -> String {
        let agent_name = self.config.agent_name.clone();
        let preview: String = query.chars().take(120).collect();
        self.emit(
            resources.events,
            session_id,
            EventType::AgentStarted,
            json!({ "query_preview": preview }),
        )
        .await;

        // Persist the user query before anything else; a store failure is
        // unrecoverable.
        if let Err(e) = resources
            .memory
            .store_message(
                session_id,
                "user",
                query,
                MessageMetadata::for_agent(&agent_name),
            )
            .await
        {
            let message = format!("Agent error: failed to store user message: {}", e);
            self.set_state(AgentState::Error);
            self.emit(
                resources.events,
                session_id,
                EventType::AgentError,
                json!({ "error": message.clone() }),
            )
            .await;
            self.emit(
                resources.events,
                session_id,
                EventType::AgentFinished,
                json!({ "reason": "error" }),
            )
            .await;
            return message;
        }

        // Seed working memory: system prompt, then the persisted session
        // (which now ends with the query we just stored).
        self.messages = vec![Message::new(Role::System, system_prompt)];
        match resources
            .memory
            .get_messages(session_id, Some(&agent_name))
            .await
        {
            Ok(stored) => self.rehydrate(&stored),
            Err(e) => {
                log::warn!(
                    "no session history rehydrated for {}: {}",
                    session_id,
                    e
                );
                self.messages.push(Message::new(Role::User, query));
            }
        }

        self.set_state(AgentState::Running);
        let mut current_step = 0usize;
        let mut stuck_escalations = 0usize;
        let mut last_response = String::new();

        while self.state != AgentState::Finished && current_step < self.config.max_steps {
            if Self::cancelled(&cancel) {
                self.emit(
                    resources.events,
                    session_id,
                    EventType::AgentFinished,
                    json!({ "reason": "cancelled" }),
                )
                .await;
                return "Run cancelled.".to_string();
            }

            current_step += 1;
            self.emit(
                resources.events,
                session_id,
                EventType::StepStarted,
                json!({ "step": current_step }),
            )
            .await;

            // Budget checks bracket every model call.
            if let Err(e) = self.limits.check_before_request(&self.usage) {
                let message = format!("Usage limit error: {}", e);
                return self
                    .finish_limited(resources, session_id, message)
                    .await;
            }

            let response = match resources.llm.complete(&self.messages, None).await {
                Ok(response) => response,
                Err(e) => {
                    let message = format!("API error: {}", e);
                    self.set_state(AgentState::Error);
                    self.persist_terminal(resources, session_id, &message).await;
                    self.emit(
                        resources.events,
                        session_id,
                        EventType::AgentError,
                        json!({ "error": message.clone() }),
                    )
                    .await;
                    self.emit(
                        resources.events,
                        session_id,
                        EventType::AgentFinished,
                        json!({ "reason": "error" }),
                    )
                    .await;
                    return message;
                }
            };

            if let Some(usage) = &response.usage {
                self.usage.incr(Usage {
                    requests: 1,
                    request_tokens: usage.prompt_tokens,
                    response_tokens: usage.completion_tokens,
                    total_tokens: usage.total_tokens,
                });
            } else {
                self.usage.incr(Usage {
                    requests: 1,
                    ..Usage::default()
                });
            }
            if let Err(e) = self.limits.check_tokens(&self.usage) {
                let message = format!("Usage limit error: {}", e);
                return self
                    .finish_limited(resources, session_id, message)
                    .await;
            }
            log::debug!(
                "agent {} step {} usage: {:?}",
                agent_name,
                current_step,
                self.usage.stats(&self.limits)
            );

            last_response = response.content.clone();
            let mut step_detected_loop = false;

            match parse_response(self.parser, &response.content) {
                ParsedResponse::Answer(answer) => {
                    self.messages
                        .push(Message::new(Role::Assistant, answer.clone()));
                    // Persistence before the final_answer event.
                    if let Err(e) = resources
                        .memory
                        .store_message(
                            session_id,
                            "assistant",
                            &answer,
                            MessageMetadata::for_agent(&agent_name),
                        )
                        .await
                    {
                        let message =
                            format!("Agent error: failed to store final answer: {}", e);
                        self.set_state(AgentState::Error);
                        self.emit(
                            resources.events,
                            session_id,
                            EventType::AgentError,
                            json!({ "error": message.clone() }),
                        )
                        .await;
                        self.emit(
                            resources.events,
                            session_id,
                            EventType::AgentFinished,
                            json!({ "reason": "error" }),
                        )
                        .await;
                        return message;
                    }
                    self.emit(
                        resources.events,
                        session_id,
                        EventType::FinalAnswer,
                        json!({ "answer": answer.clone() }),
                    )
                    .await;
                    self.set_state(AgentState::Finished);
                    self.emit(
                        resources.events,
                        session_id,
                        EventType::AgentFinished,
                        json!({ "reason": "completed", "steps": current_step }),
                    )
                    .await;
                    return answer;
                }

                ParsedResponse::Action(payload) => {
                    self.set_state(AgentState::ToolCalling);
                    match self
                        .act(
                            resources,
                            session_id,
                            &response.content,
                            &payload,
                        )
                        .await
                    {
                        Ok(()) => {}
                        Err(message) => {
                            self.set_state(AgentState::Error);
                            self.persist_terminal(resources, session_id, &message).await;
                            self.emit(
                                resources.events,
                                session_id,
                                EventType::AgentError,
                                json!({ "error": message.clone() }),
                            )
                            .await;
                            self.emit(
                                resources.events,
                                session_id,
                                EventType::AgentFinished,
                                json!({ "reason": "error" }),
                            )
                            .await;
                            return message;
                        }
                    }
                    step_detected_loop = self
                        .apply_stuck_protocol_if_looping(
                            resources,
                            session_id,
                            system_prompt,
                            false,
                        )
                        .await;
                }

                ParsedResponse::ParseError(reason) => {
                    let error_message = if reason.is_empty() {
                        "Invalid response format. Please use the correct required format"
                            .to_string()
                    } else {
                        reason
                    };
                    self.messages
                        .push(Message::new(Role::User, error_message.clone()));
                    if let Err(e) = resources
                        .memory
                        .store_message(
                            session_id,
                            "user",
                            &error_message,
                            MessageMetadata::for_agent(&agent_name),
                        )
                        .await
                    {
                        log::error!("failed to persist parse-error message: {}", e);
                    }
                    self.loop_detector
                        .record_message(&error_message, &response.content);
                    step_detected_loop = self
                        .apply_stuck_protocol_if_looping(
                            resources,
                            session_id,
                            system_prompt,
                            true,
                        )
                        .await;
                }
            }

            if step_detected_loop {
                stuck_escalations += 1;
                if stuck_escalations >= MAX_STUCK_ESCALATIONS {
                    let message = format!(
                        "Agent error: loop detected {} times in one run; aborting",
                        stuck_escalations
                    );
                    self.set_state(AgentState::Error);
                    self.persist_terminal(resources, session_id, &message).await;
                    self.emit(
                        resources.events,
                        session_id,
                        EventType::AgentError,
                        json!({ "error": message.clone(), "reason": "loop_escalation" }),
                    )
                    .await;
                    self.emit(
                        resources.events,
                        session_id,
                        EventType::AgentFinished,
                        json!({ "reason": "error" }),
                    )
                    .await;
                    return message;
                }
            } else {
                stuck_escalations = 0;
            }
        }

        // Step budget exhausted.
        let message = format!(
            "Maximum steps ({}) reached. Last response: {}",
            self.config.max_steps, last_response
        );
        self.persist_terminal(resources, session_id, &message).await;
        self.emit(
            resources.events,
            session_id,
            EventType::AgentFinished,
            json!({ "reason": "max_steps", "steps": current_step }),
        )
        .await;
        message
    }

    /// Limit handling shared by the request and token checks.
    async fn finish_limited(
        &mut self,
        resources: &RunResources<'_>,
        session_id: &str,
        message: String,
    ) -> String {
        self.persist_terminal(resources, session_id, &message).await;
        self.emit(
            resources.events,
            session_id,
            EventType::LimitExceeded,
            json!({ "message": message.clone() }),
        )
        .await;
        self.emit(
            resources.events,
            session_id,
            EventType::AgentFinished,
            json!({ "reason": "limit_exceeded" }),
        )
        .await;
        message
    }

    /// Resolve, execute, observe.  Returns `Err` only for unrecoverable
    /// store failures; tool failures become observations.
    async fn act(
        &mut self,
        resources: &RunResources<'_>,
        session_id: &str,
        raw_response: &str,
        action_payload: &str,
    ) -> Result<(), String> {
        let agent_name = self.config.agent_name.clone();

        let (tool_name, observation, args_string) = match decode_action(action_payload) {
            Err(reason) => ("N/A".to_string(), reason, String::new()),
            Ok(action) => {
                let args_string = action.parameters.to_string();
                match resolve_tool_call(
                    &action.tool,
                    action.parameters.clone(),
                    resources.sessions,
                    resources.remote_catalog,
                    resources.local_tools,
                )
                .await
                {
                    Err(e) => (action.tool.clone(), e.to_string(), args_string),
                    Ok(resolved) => {
                        let tool_call_id = uuid::Uuid::new_v4().to_string();
                        let origin = resolved.executor.origin();
                        self.emit(
                            resources.events,
                            session_id,
                            EventType::ToolCallRequested,
                            json!({
                                "tool_call_id": tool_call_id.clone(),
                                "tool_name": resolved.tool_name.clone(),
                                "arguments": resolved.arguments.clone(),
                                "origin": origin,
                            }),
                        )
                        .await;

                        // Persist the assistant message with its tool-call
                        // metadata before executing.
                        let spec = ToolCallSpec {
                            id: tool_call_id.clone(),
                            name: resolved.tool_name.clone(),
                            arguments: args_string.clone(),
                        };
                        resources
                            .memory
                            .store_message(
                                session_id,
                                "assistant",
                                raw_response,
                                MessageMetadata::with_tool_calls(&agent_name, vec![spec.clone()]),
                            )
                            .await
                            .map_err(|e| {
                                format!("Agent error: failed to store tool call: {}", e)
                            })?;
                        self.messages.push(Message {
                            role: Role::Assistant,
                            content: raw_response.to_string(),
                            tool_calls: vec![spec],
                        });

                        let timeout = Duration::from_secs(self.config.tool_call_timeout);
                        let execution = execute_with_timeout(&resolved, timeout).await;

                        let (event_type, mut payload) = if execution.success {
                            (
                                EventType::ToolCallCompleted,
                                json!({
                                    "tool_call_id": tool_call_id.clone(),
                                    "tool_name": resolved.tool_name.clone(),
                                }),
                            )
                        } else {
                            (
                                EventType::ToolCallFailed,
                                json!({
                                    "tool_call_id": tool_call_id.clone(),
                                    "tool_name": resolved.tool_name.clone(),
                                    "error": execution.observation.clone(),
                                }),
                            )
                        };
                        if execution.timed_out {
                            payload["timed_out"] = json!(true);
                        }
                        self.emit(resources.events, session_id, event_type, payload)
                            .await;

                        // Tool result is persisted after execution.
                        resources
                            .memory
                            .store_message(
                                session_id,
                                "tool",
                                &execution.observation,
                                MessageMetadata::for_tool_result(&agent_name, &tool_call_id),
                            )
                            .await
                            .map_err(|e| {
                                format!("Agent error: failed to store tool result: {}", e)
                            })?;
                        self.messages.push(Message::new(
                            Role::Tool {
                                call_id: tool_call_id,
                            },
                            execution.observation.clone(),
                        ));

                        (resolved.tool_name.clone(), execution.observation, args_string)
                    }
                }
            }
        };

        // Observation feedback into working memory and the session.
        let observation_message = format!(
            "OBSERVATION(RESULT FROM {} TOOL CALL):\n{}",
            tool_name, observation
        );
        self.messages
            .push(Message::new(Role::User, observation_message.clone()));
        resources
            .memory
            .store_message(
                session_id,
                "user",
                &observation_message,
                MessageMetadata::for_agent(&agent_name),
            )
            .await
            .map_err(|e| format!("Agent error: failed to store observation: {}", e))?;
        self.emit(
            resources.events,
            session_id,
            EventType::ObservationRecorded,
            json!({ "tool_name": tool_name.clone() }),
        )
        .await;
        self.set_state(AgentState::Observing);

        self.loop_detector
            .record_tool_call(&tool_name, &args_string, &observation);
        Ok(())
    }

    /// If the detector fires, apply the stuck protocol: rewrite the system
    /// prompt, inject guidance, reset the detector, and return `true`.
    async fn apply_stuck_protocol_if_looping(
        &mut self,
        resources: &RunResources<'_>,
        session_id: &str,
        original_system_prompt: &str,
        message_stuck: bool,
    ) -> bool {
        let loop_type = match self.loop_detector.loop_type() {
            Some(loop_type) => loop_type,
            None => return false,
        };
        log::warn!(
            "agent {} loop detected: {}",
            self.config.agent_name,
            loop_type.as_str()
        );
        self.emit(
            resources.events,
            session_id,
            EventType::LoopDetected,
            json!({ "loop_type": loop_type.as_str() }),
        )
        .await;

        self.set_state(AgentState::Stuck);
        let rewritten = stuck_prompt(original_system_prompt, message_stuck);
        self.reset_system_prompt(&rewritten);
        let guidance = format!(
            "Observation:\nLoop detected: {}\n\nThe current approach is not working. \
             Analyze why the previous attempts failed, then try a different tool or \
             approach, or explain the issue instead of retrying.",
            loop_type.as_str()
        );
        self.messages.push(Message::new(Role::User, guidance));
        self.loop_detector.reset();
        self.set_state(AgentState::Running);
        true
    }
}
