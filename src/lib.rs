// src/lib.rs

// Import the top-level `agentloop` module.
pub mod agentloop;

// Re-export the submodules at the crate root so external code addresses
// them as agentloop::memory, agentloop::react, etc. without the extra
// hierarchy level.
pub use crate::agentloop::{
    agent, background, config, dispatcher, events, llm, loop_detector, memory, parser, prompt,
    react, tool_protocol, tool_server, tools, usage,
};

// Re-export the workhorse types for easier external access.
pub use crate::agentloop::{
    Agent, AgentConfig, AgentRunResult, AgentState, BackgroundAgentConfig,
    BackgroundAgentManager, Event, EventRouter, EventType, LLMAdapter, LLMResponse, MemoryRouter,
    MemoryStore, Message, ReactEngine, Role, Schedule, ToolRegistry,
};
