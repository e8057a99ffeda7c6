//! Tool Dispatch
//!
//! The dispatcher unifies local and remote tool lookup.  Given a parsed
//! tool-call request it resolves the name to an executor, and the engine
//! then runs the executor under the configured timeout.
//!
//! # Resolution order
//!
//! 1. The remote catalog is searched first, by case-insensitive name match.
//!    A hit builds a remote executor bound to the owning server session.
//! 2. Otherwise the local registry is searched.
//! 3. Otherwise the call fails with [`ToolError::NotFound`].
//!
//! Remote tools therefore take precedence over local tools of the same
//! name, which allows deployment-time overrides of in-process defaults.
//!
//! # Result envelope
//!
//! Every execution result is wrapped as
//! `{"status": "success", "data": …}` or
//! `{"status": "error", "message": …}` and decoded back into the
//! observation text fed to the model: `data` verbatim on success,
//! `"Error: " + message` on failure.  The run continues either way.

use crate::agentloop::tool_protocol::{ToolError, ToolRegistry};
use crate::agentloop::tool_server::{RemoteToolCatalog, ToolServerSession};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Observation text used when a tool call exceeds its timeout.
pub const TOOL_TIMEOUT_OBSERVATION: &str =
    "Tool call timed out. Please try again or use a different approach.";

/// Where a resolved tool call will execute.
#[derive(Clone)]
pub enum ToolExecutor {
    /// An in-process function from the local registry.
    Local(Arc<ToolRegistry>),
    /// A tool hosted by a remote server session.
    Remote {
        /// Name of the owning server, for events and logging.
        server: String,
        /// The session the call is bound to.
        session: Arc<dyn ToolServerSession>,
    },
}

impl ToolExecutor {
    /// Origin tag recorded on events (`"local"` or `"remote:<server>"`).
    pub fn origin(&self) -> String {
        match self {
            ToolExecutor::Local(_) => "local".to_string(),
            ToolExecutor::Remote { server, .. } => format!("remote:{}", server),
        }
    }
}

impl fmt::Debug for ToolExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolExecutor::Local(_) => f.debug_tuple("Local").finish(),
            ToolExecutor::Remote { server, .. } => {
                f.debug_struct("Remote").field("server", server).finish()
            }
        }
    }
}

/// A tool call resolved to an executor with its canonical name.
#[derive(Clone, Debug)]
pub struct ResolvedToolCall {
    /// Where the call executes.
    pub executor: ToolExecutor,
    /// Canonical tool name (the descriptor's casing, not the model's).
    pub tool_name: String,
    /// Arguments forwarded to the executor.
    pub arguments: JsonValue,
}

/// Resolve a tool name to an executor.
///
/// See the module docs for the resolution order.
pub async fn resolve_tool_call(
    tool_name: &str,
    arguments: JsonValue,
    sessions: &HashMap<String, Arc<dyn ToolServerSession>>,
    remote_catalog: &RemoteToolCatalog,
    local_registry: &Arc<ToolRegistry>,
) -> Result<ResolvedToolCall, ToolError> {
    if tool_name.trim().is_empty() {
        return Err(ToolError::InvalidParameters(
            "no tool name provided in the request".to_string(),
        ));
    }

    // Remote tools first.
    for (server_name, descriptors) in remote_catalog {
        for descriptor in descriptors {
            if descriptor.name.eq_ignore_ascii_case(tool_name) {
                let session = sessions.get(server_name).ok_or_else(|| {
                    ToolError::ProtocolError(format!(
                        "tool '{}' belongs to server '{}' but no session is connected",
                        descriptor.name, server_name
                    ))
                })?;
                return Ok(ResolvedToolCall {
                    executor: ToolExecutor::Remote {
                        server: server_name.clone(),
                        session: session.clone(),
                    },
                    tool_name: descriptor.name.clone(),
                    arguments,
                });
            }
        }
    }

    // Then the local registry.
    if local_registry.contains(tool_name).await {
        return Ok(ResolvedToolCall {
            executor: ToolExecutor::Local(local_registry.clone()),
            tool_name: tool_name.to_string(),
            arguments,
        });
    }

    Err(ToolError::NotFound(tool_name.to_string()))
}

/// Outcome of one tool execution, already decoded from the envelope.
#[derive(Debug, Clone)]
pub struct ToolExecution {
    /// The observation text to feed back to the model.
    pub observation: String,
    /// Whether the call succeeded.
    pub success: bool,
    /// Whether the call was cut off by the timeout.
    pub timed_out: bool,
}

/// Stringify a payload for the observation: strings verbatim, everything
/// else as compact JSON.
fn stringify(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Wrap a raw execution result in the status envelope.
fn envelope(result: Result<JsonValue, String>) -> JsonValue {
    match result {
        Ok(data) => serde_json::json!({"status": "success", "data": data}),
        Err(message) => serde_json::json!({"status": "error", "message": message}),
    }
}

/// Decode an envelope into `(observation, success)`.
fn decode_envelope(envelope: &JsonValue) -> (String, bool) {
    if envelope["status"] == "success" {
        (stringify(&envelope["data"]), true)
    } else {
        let message = envelope["message"]
            .as_str()
            .unwrap_or("Unknown error")
            .to_string();
        (format!("Error: {}", message), false)
    }
}

/// Execute a resolved call under a timeout and decode the result envelope.
///
/// Never returns an error: failures (including timeouts) become observation
/// text so the ReAct loop can continue.
pub async fn execute_with_timeout(call: &ResolvedToolCall, timeout: Duration) -> ToolExecution {
    let raw = tokio::time::timeout(timeout, async {
        match &call.executor {
            ToolExecutor::Local(registry) => {
                match registry.execute(&call.tool_name, call.arguments.clone()).await {
                    Ok(result) if result.success => Ok(result.output),
                    Ok(result) => Err(result
                        .error
                        .unwrap_or_else(|| "Unknown error".to_string())),
                    Err(e) => Err(e.to_string()),
                }
            }
            ToolExecutor::Remote { session, .. } => session
                .call_tool(&call.tool_name, call.arguments.clone())
                .await
                .map_err(|e| e.to_string()),
        }
    })
    .await;

    match raw {
        Ok(result) => {
            let (observation, success) = decode_envelope(&envelope(result));
            ToolExecution {
                observation,
                success,
                timed_out: false,
            }
        }
        Err(_) => {
            log::warn!(
                "tool '{}' timed out after {:?}",
                call.tool_name,
                timeout
            );
            ToolExecution {
                observation: TOOL_TIMEOUT_OBSERVATION.to_string(),
                success: false,
                timed_out: true,
            }
        }
    }
}
