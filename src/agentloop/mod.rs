// src/agentloop/mod.rs

pub mod agent;
pub mod background;
pub mod config;
pub mod dispatcher;
pub mod events;
pub mod llm;
pub mod loop_detector;
pub mod memory;
pub mod parser;
pub mod prompt;
pub mod react;
pub mod tool_protocol;
pub mod tool_server;
pub mod tools;
pub mod usage;

// Export the workhorse types at the module level so callers can write
// agentloop::Agent instead of agentloop::agent::Agent.
pub use agent::{Agent, AgentRunResult};
pub use background::{BackgroundAgentConfig, BackgroundAgentManager, Schedule};
pub use config::AgentConfig;
pub use events::{Event, EventRouter, EventType};
pub use llm::{LLMAdapter, LLMResponse, Message, Role};
pub use memory::{MemoryRouter, MemoryStore};
pub use react::{AgentState, ReactEngine};
pub use tool_protocol::ToolRegistry;
