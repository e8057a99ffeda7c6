//! Shared primitives for provider-agnostic LLM adapters.
//!
//! Applications plug a concrete provider into agentloop through the
//! [`LLMAdapter`] trait and the lightweight data types defined in this module.
//! The trait abstracts over vendor SDKs while the supporting structs describe
//! chat messages and token accounting.  Conversation bookkeeping is *not* the
//! adapter's job: the [`ReactEngine`](crate::react::ReactEngine) owns working
//! memory and hands the adapter a fully assembled message list on every step.
//!
//! # Implementing an adapter
//!
//! ```rust,no_run
//! use agentloop::llm::{LLMAdapter, LLMError, LLMResponse, Message, ToolDefinition};
//! use async_trait::async_trait;
//!
//! struct MyProvider;
//!
//! #[async_trait]
//! impl LLMAdapter for MyProvider {
//!     async fn complete(
//!         &self,
//!         messages: &[Message],
//!         _tools: Option<Vec<ToolDefinition>>,
//!     ) -> Result<LLMResponse, LLMError> {
//!         // translate `messages` into the provider wire format, call it,
//!         // and map the response back
//!         # let _ = messages;
//!         Ok(LLMResponse { content: "Final Answer: 42".into(), usage: None })
//!     }
//!
//!     fn model_name(&self) -> &str {
//!         "my-model-1"
//!     }
//! }
//! ```
//!
//! # Retries
//!
//! Transient failures (rate limits, timeouts, connection resets) are the
//! adapter's concern.  Implementations should wrap their provider call in
//! [`retry_with_backoff`], which retries retryable [`LLMError`]s with
//! exponential backoff (3 attempts, base 1 s, capped at 30 s) before
//! surfacing the failure to the engine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Role of a chat message presented to the LLM.
#[derive(Debug, Clone, PartialEq)]
pub enum Role {
    /// A system authored message that primes or constrains assistant behaviour.
    System,
    /// A user authored message (the query, observations, corrective prompts).
    User,
    /// An assistant authored message (model responses, possibly carrying tool calls).
    Assistant,
    /// A tool-result message correlating with a prior assistant tool call.
    ///
    /// Serialises as `{"role": "tool", "tool_call_id": "<call_id>", ...}` in
    /// OpenAI-compatible wire formats.
    Tool {
        /// Id of the tool call this message answers.
        call_id: String,
    },
}

impl Role {
    /// The wire-format role string (`"system"`, `"user"`, `"assistant"`, `"tool"`).
    pub fn as_str(&self) -> &str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool { .. } => "tool",
        }
    }
}

/// A structured tool call declared by an assistant message.
///
/// The `arguments` field carries the raw JSON text exactly as the model (or
/// the dispatcher) produced it, so it can round-trip through persistence
/// without re-encoding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallSpec {
    /// Unique id correlating the call with its tool-role response.
    pub id: String,
    /// Name of the tool being invoked.
    pub name: String,
    /// JSON-encoded arguments.
    pub arguments: String,
}

/// A single message in the working-memory list sent to the adapter.
#[derive(Debug, Clone)]
pub struct Message {
    /// The role associated with the message.
    pub role: Role,
    /// The message body.
    pub content: String,
    /// Tool calls declared by this message.  Non-empty only on assistant
    /// messages that requested tools.
    pub tool_calls: Vec<ToolCallSpec>,
}

impl Message {
    /// Convenience constructor for a plain message without tool calls.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }
}

/// Token accounting reported by the provider for one completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens billed for the prompt.
    pub prompt_tokens: usize,
    /// Tokens billed for the completion.
    pub completion_tokens: usize,
    /// Convenience total equal to `prompt_tokens + completion_tokens`.
    pub total_tokens: usize,
}

/// The adapter's answer to one [`LLMAdapter::complete`] call.
#[derive(Debug, Clone)]
pub struct LLMResponse {
    /// Raw text of the first choice's message.
    pub content: String,
    /// Token usage for this round trip, when the provider reports it.
    pub usage: Option<TokenUsage>,
}

/// Provider-agnostic tool schema forwarded to adapters that support native
/// function calling.
///
/// agentloop's ReAct protocol communicates tools through the system prompt,
/// so most adapters can ignore this parameter; it exists so adapters that
/// *do* speak a native function-calling API receive the same catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name as it would appear in the provider's `tools` array.
    pub name: String,
    /// Human-readable description surfaced to the LLM.
    pub description: String,
    /// JSON Schema object describing the accepted parameters.
    pub parameters_schema: serde_json::Value,
}

/// Errors surfaced by an [`LLMAdapter`].
///
/// The first three variants are considered retryable; adapters should run
/// them through [`retry_with_backoff`] before returning.
#[derive(Debug, Clone)]
pub enum LLMError {
    /// The provider rejected the request due to rate limiting.
    RateLimited(String),
    /// The request timed out in transit or on the provider side.
    Timeout(String),
    /// The connection to the provider failed.
    Connection(String),
    /// Any other provider-reported failure (auth, bad request, server error).
    Provider(String),
}

impl LLMError {
    /// Whether [`retry_with_backoff`] should retry this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LLMError::RateLimited(_) | LLMError::Timeout(_) | LLMError::Connection(_)
        )
    }
}

impl fmt::Display for LLMError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LLMError::RateLimited(msg) => write!(f, "Rate limited: {}", msg),
            LLMError::Timeout(msg) => write!(f, "Request timed out: {}", msg),
            LLMError::Connection(msg) => write!(f, "Connection error: {}", msg),
            LLMError::Provider(msg) => write!(f, "Provider error: {}", msg),
        }
    }
}

impl Error for LLMError {}

/// Trait-driven abstraction for a concrete LLM provider.
///
/// Implementations **must** be thread-safe (`Send + Sync`) so they can be
/// shared between agents and background tasks.  Where a provider exposes
/// token accounting, adapters should populate [`LLMResponse::usage`] so the
/// [`UsageLimits`](crate::usage::UsageLimits) checks have data to work with.
#[async_trait]
pub trait LLMAdapter: Send + Sync {
    /// Send a full request/response chat completion.
    ///
    /// `messages` is the complete working-memory list including the system
    /// prompt; `tools` carries the native-function-calling catalog for
    /// adapters that support it (may be ignored).
    async fn complete(
        &self,
        messages: &[Message],
        tools: Option<Vec<ToolDefinition>>,
    ) -> Result<LLMResponse, LLMError>;

    /// Identifier of the upstream model (e.g. `"gpt-4.1"`), for logging.
    fn model_name(&self) -> &str;
}

/// Number of attempts made by [`retry_with_backoff`].
pub const RETRY_ATTEMPTS: u32 = 3;
/// Base delay for the exponential backoff, in milliseconds.
pub const RETRY_BASE_MS: u64 = 1_000;
/// Delay cap for the exponential backoff, in milliseconds.
pub const RETRY_CAP_MS: u64 = 30_000;

/// Retry an adapter call with exponential backoff.
///
/// Runs `op` up to [`RETRY_ATTEMPTS`] times, sleeping `base * 2^attempt`
/// (capped at [`RETRY_CAP_MS`]) between attempts.  Non-retryable errors and
/// the final failure are returned as-is.
pub async fn retry_with_backoff<T, F, Fut>(mut op: F) -> Result<T, LLMError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LLMError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < RETRY_ATTEMPTS => {
                let delay = RETRY_BASE_MS
                    .saturating_mul(1u64 << attempt)
                    .min(RETRY_CAP_MS);
                log::warn!(
                    "LLM call failed (attempt {}/{}): {}; retrying in {} ms",
                    attempt + 1,
                    RETRY_ATTEMPTS,
                    err,
                    delay
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn retry_recovers_from_transient_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let result = retry_with_backoff(move || {
            let calls = calls_clone.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(LLMError::Connection("reset".into()))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_does_not_retry_provider_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let result: Result<(), _> = retry_with_backoff(move || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(LLMError::Provider("bad auth".into()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn role_strings() {
        assert_eq!(Role::System.as_str(), "system");
        assert_eq!(
            Role::Tool {
                call_id: "c1".into()
            }
            .as_str(),
            "tool"
        );
    }
}
