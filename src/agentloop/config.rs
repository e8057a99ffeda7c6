//! Agent configuration.
//!
//! [`AgentConfig`] is the full configuration surface recognised by the core.
//! All fields except `agent_name` have sensible defaults, so the struct can
//! be deserialized from a partial JSON/TOML fragment or built in code:
//!
//! ```rust
//! use agentloop::config::{AgentConfig, MemoryConfig, MemoryMode};
//!
//! let config = AgentConfig {
//!     agent_name: "researcher".into(),
//!     max_steps: 15,
//!     memory_config: MemoryConfig { mode: MemoryMode::TokenBudget, value: 30_000 },
//!     ..AgentConfig::new("researcher")
//! };
//! assert_eq!(config.tool_call_timeout, 30);
//! ```

use serde::{Deserialize, Serialize};

/// Retention mode for working-memory reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryMode {
    /// Keep at most `value` most-recent messages.
    SlidingWindow,
    /// Drop oldest messages until the whitespace-token sum fits `value`.
    TokenBudget,
}

/// Memory retention configuration applied by the message store at read time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Retention mode.
    pub mode: MemoryMode,
    /// Window size (messages) or token budget, depending on `mode`.
    pub value: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            mode: MemoryMode::TokenBudget,
            value: 30_000,
        }
    }
}

/// Configuration recognised by the agent core.
///
/// A value of `0` for `request_limit` or `total_tokens_limit` means
/// "unbounded".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Stable agent identifier; stamped onto messages and events.
    pub agent_name: String,
    /// Maximum ReAct steps per run.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// Per-tool-call timeout in seconds.
    #[serde(default = "default_tool_call_timeout")]
    pub tool_call_timeout: u64,
    /// Maximum LLM requests per run (0 = unbounded).
    #[serde(default)]
    pub request_limit: usize,
    /// Maximum total tokens per run (0 = unbounded).
    #[serde(default)]
    pub total_tokens_limit: usize,
    /// Working-memory retention policy.
    #[serde(default)]
    pub memory_config: MemoryConfig,
    /// Rolling-window size for the loop detector.
    #[serde(default = "default_loop_window_size")]
    pub loop_window_size: usize,
    /// Consecutive repetitions that count as a loop.
    #[serde(default = "default_loop_repeat_threshold")]
    pub loop_repeat_threshold: usize,
}

fn default_max_steps() -> usize {
    10
}

fn default_tool_call_timeout() -> u64 {
    30
}

fn default_loop_window_size() -> usize {
    8
}

fn default_loop_repeat_threshold() -> usize {
    3
}

impl AgentConfig {
    /// Create a config with the given name and all defaults.
    pub fn new(agent_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            max_steps: default_max_steps(),
            tool_call_timeout: default_tool_call_timeout(),
            request_limit: 0,
            total_tokens_limit: 0,
            memory_config: MemoryConfig::default(),
            loop_window_size: default_loop_window_size(),
            loop_repeat_threshold: default_loop_repeat_threshold(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AgentConfig::new("a");
        assert_eq!(config.max_steps, 10);
        assert_eq!(config.tool_call_timeout, 30);
        assert_eq!(config.request_limit, 0);
        assert_eq!(config.total_tokens_limit, 0);
        assert_eq!(config.loop_window_size, 8);
        assert_eq!(config.loop_repeat_threshold, 3);
    }

    #[test]
    fn partial_json_deserializes_with_defaults() {
        let config: AgentConfig =
            serde_json::from_str(r#"{"agent_name": "bot", "max_steps": 5}"#).unwrap();
        assert_eq!(config.agent_name, "bot");
        assert_eq!(config.max_steps, 5);
        assert_eq!(config.tool_call_timeout, 30);
        assert_eq!(config.memory_config.value, 30_000);
    }
}
