//! Local Tool Registry
//!
//! This module holds the tools an agent can execute in-process: plain Rust
//! functions (sync or async) registered under a name together with a
//! description and a JSON-Schema-shaped parameter list.
//!
//! # Key Components
//!
//! - **ToolMetadata / ToolParameter**: tool identity, description, typed
//!   parameter definitions
//! - **ToolRegistry**: name → function mapping with validation and execution
//! - **ToolResult**: structured execution results
//!
//! Registration is idempotent: re-registering a name replaces the previous
//! entry.  Arguments are validated against the declared parameters before
//! the function runs — a missing required parameter is a validation error,
//! extra properties are permitted.
//!
//! # Example
//!
//! ```rust,no_run
//! use agentloop::tool_protocol::{
//!     ToolMetadata, ToolParameter, ToolParameterType, ToolRegistry, ToolResult,
//! };
//! use std::sync::Arc;
//!
//! # async {
//! let registry = ToolRegistry::new();
//! registry
//!     .register(
//!         ToolMetadata::new("add", "Adds two numbers")
//!             .with_parameter(ToolParameter::new("a", ToolParameterType::Number).required())
//!             .with_parameter(ToolParameter::new("b", ToolParameterType::Number).required()),
//!         Arc::new(|args| {
//!             let a = args["a"].as_f64().unwrap_or(0.0);
//!             let b = args["b"].as_f64().unwrap_or(0.0);
//!             Ok(ToolResult::success(serde_json::json!(a + b)))
//!         }),
//!     )
//!     .await;
//!
//! let result = registry.execute("add", serde_json::json!({"a": 2, "b": 3})).await.unwrap();
//! assert!(result.success);
//! # };
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Result of a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Whether the tool executed without an application-level failure.
    pub success: bool,
    /// The output data from the tool.
    pub output: JsonValue,
    /// Error message when `success` is false.
    pub error: Option<String>,
}

impl ToolResult {
    /// Convenience constructor for a successful execution.
    pub fn success(output: JsonValue) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    /// Convenience constructor for a failed execution.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: JsonValue::Null,
            error: Some(error.into()),
        }
    }
}

/// Type of a tool parameter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ToolParameterType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl ToolParameterType {
    fn matches(&self, value: &JsonValue) -> bool {
        match self {
            ToolParameterType::String => value.is_string(),
            ToolParameterType::Number => value.is_number(),
            ToolParameterType::Integer => value.is_i64() || value.is_u64(),
            ToolParameterType::Boolean => value.is_boolean(),
            ToolParameterType::Array => value.is_array(),
            ToolParameterType::Object => value.is_object(),
        }
    }

    fn schema_name(&self) -> &'static str {
        match self {
            ToolParameterType::String => "string",
            ToolParameterType::Number => "number",
            ToolParameterType::Integer => "integer",
            ToolParameterType::Boolean => "boolean",
            ToolParameterType::Array => "array",
            ToolParameterType::Object => "object",
        }
    }
}

/// A single tool parameter definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolParameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ToolParameterType,
    pub description: Option<String>,
    pub required: bool,
}

impl ToolParameter {
    /// Define a parameter with the provided name and type.
    pub fn new(name: impl Into<String>, param_type: ToolParameterType) -> Self {
        Self {
            name: name.into(),
            param_type,
            description: None,
            required: false,
        }
    }

    /// Add a human-readable description that surfaces in the tool catalog.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Mark the parameter as required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Metadata describing a tool's interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ToolParameter>,
}

impl ToolMetadata {
    /// Create metadata with the supplied identifier and description.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    /// Append a parameter definition.
    pub fn with_parameter(mut self, param: ToolParameter) -> Self {
        self.parameters.push(param);
        self
    }

    /// Render the parameter list as a JSON-Schema-shaped object
    /// (`{"type": "object", "properties": {...}, "required": [...]}`).
    pub fn input_schema(&self) -> JsonValue {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for param in &self.parameters {
            let mut prop = serde_json::Map::new();
            prop.insert(
                "type".to_string(),
                JsonValue::String(param.param_type.schema_name().to_string()),
            );
            if let Some(description) = &param.description {
                prop.insert(
                    "description".to_string(),
                    JsonValue::String(description.clone()),
                );
            }
            properties.insert(param.name.clone(), JsonValue::Object(prop));
            if param.required {
                required.push(JsonValue::String(param.name.clone()));
            }
        }
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }

    /// Convert to the provider-facing tool definition.
    pub fn to_tool_definition(&self) -> crate::agentloop::llm::ToolDefinition {
        crate::agentloop::llm::ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters_schema: self.input_schema(),
        }
    }
}

/// Error types for tool operations.
#[derive(Debug, Clone)]
pub enum ToolError {
    /// Requested tool is not registered anywhere the dispatcher looked.
    NotFound(String),
    /// Tool execution completed with an application-level failure.
    ExecutionFailed(String),
    /// The provided JSON arguments failed validation.
    InvalidParameters(String),
    /// A lower-level transport error occurred while reaching a tool server.
    ProtocolError(String),
    /// The call exceeded its timeout.
    Timeout(String),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::NotFound(name) => write!(f, "Tool not found: {}", name),
            ToolError::ExecutionFailed(msg) => write!(f, "Tool execution failed: {}", msg),
            ToolError::InvalidParameters(msg) => write!(f, "Invalid parameters: {}", msg),
            ToolError::ProtocolError(msg) => write!(f, "Protocol error: {}", msg),
            ToolError::Timeout(msg) => write!(f, "Tool call timed out: {}", msg),
        }
    }
}

impl Error for ToolError {}

/// Type alias for synchronous tool functions.
pub type ToolFunction =
    Arc<dyn Fn(JsonValue) -> Result<ToolResult, Box<dyn Error + Send + Sync>> + Send + Sync>;

/// Type alias for asynchronous tool functions.
pub type AsyncToolFunction = Arc<
    dyn Fn(
            JsonValue,
        ) -> std::pin::Pin<
            Box<
                dyn std::future::Future<Output = Result<ToolResult, Box<dyn Error + Send + Sync>>>
                    + Send,
            >,
        > + Send
        + Sync,
>;

/// Registry of locally executable tools.
///
/// Read-mostly after startup; registrations during operation are permitted
/// and atomic (guarded by the internal `RwLock`s).
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, ToolMetadata>>,
    sync_functions: RwLock<HashMap<String, ToolFunction>>,
    async_functions: RwLock<HashMap<String, AsyncToolFunction>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous tool function.
    ///
    /// Idempotent: a subsequent call with the same name replaces the
    /// existing registration.
    pub async fn register(&self, metadata: ToolMetadata, function: ToolFunction) {
        let name = metadata.name.clone();
        self.tools.write().await.insert(name.clone(), metadata);
        self.async_functions.write().await.remove(&name);
        self.sync_functions.write().await.insert(name, function);
    }

    /// Register an asynchronous tool function.
    pub async fn register_async(&self, metadata: ToolMetadata, function: AsyncToolFunction) {
        let name = metadata.name.clone();
        self.tools.write().await.insert(name.clone(), metadata);
        self.sync_functions.write().await.remove(&name);
        self.async_functions.write().await.insert(name, function);
    }

    /// Remove a tool from the registry.
    pub async fn unregister(&self, name: &str) {
        self.tools.write().await.remove(name);
        self.sync_functions.write().await.remove(name);
        self.async_functions.write().await.remove(name);
    }

    /// Metadata for every registered tool.
    pub async fn list(&self) -> Vec<ToolMetadata> {
        self.tools.read().await.values().cloned().collect()
    }

    /// Metadata for one tool, if registered.
    pub async fn get(&self, name: &str) -> Option<ToolMetadata> {
        self.tools.read().await.get(name).cloned()
    }

    /// Whether a tool with this name is registered.
    pub async fn contains(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    /// Validate `args` against a tool's declared parameters.
    ///
    /// Missing required parameter → [`ToolError::InvalidParameters`].
    /// Declared-type mismatches are rejected the same way (an integer is
    /// accepted where a number is declared).  Extra properties pass.
    pub async fn validate_arguments(&self, name: &str, args: &JsonValue) -> Result<(), ToolError> {
        let tools = self.tools.read().await;
        let metadata = tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))?;

        let object = match args {
            JsonValue::Object(map) => map,
            JsonValue::Null => {
                return if metadata.parameters.iter().any(|p| p.required) {
                    Err(ToolError::InvalidParameters(format!(
                        "tool '{}' requires parameters but none were given",
                        name
                    )))
                } else {
                    Ok(())
                };
            }
            _ => {
                return Err(ToolError::InvalidParameters(format!(
                    "arguments for tool '{}' must be a JSON object",
                    name
                )))
            }
        };

        for param in &metadata.parameters {
            match object.get(&param.name) {
                None if param.required => {
                    return Err(ToolError::InvalidParameters(format!(
                        "missing required parameter '{}' for tool '{}'",
                        param.name, name
                    )));
                }
                Some(value) if !value.is_null() && !param.param_type.matches(value) => {
                    return Err(ToolError::InvalidParameters(format!(
                        "parameter '{}' of tool '{}' expects {}",
                        param.name,
                        name,
                        param.param_type.schema_name()
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Validate and execute a tool.  Async functions are awaited; sync
    /// functions run inline.
    pub async fn execute(
        &self,
        name: &str,
        args: JsonValue,
    ) -> Result<ToolResult, Box<dyn Error + Send + Sync>> {
        self.validate_arguments(name, &args).await?;

        let async_function = {
            let async_funcs = self.async_functions.read().await;
            async_funcs.get(name).cloned()
        };
        if let Some(function) = async_function {
            return function(args).await;
        }

        let sync_function = {
            let sync_funcs = self.sync_functions.read().await;
            sync_funcs.get(name).cloned()
        };
        match sync_function {
            Some(function) => function(args),
            None => Err(Box::new(ToolError::NotFound(name.to_string()))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry_with_add() -> ToolRegistry {
        let registry = ToolRegistry::new();
        registry
            .register(
                ToolMetadata::new("add", "Adds two numbers")
                    .with_parameter(ToolParameter::new("a", ToolParameterType::Number).required())
                    .with_parameter(ToolParameter::new("b", ToolParameterType::Number).required()),
                Arc::new(|args| {
                    let a = args["a"].as_f64().unwrap_or(0.0);
                    let b = args["b"].as_f64().unwrap_or(0.0);
                    Ok(ToolResult::success(serde_json::json!(a + b)))
                }),
            )
            .await;
        registry
    }

    #[tokio::test]
    async fn execute_sync_tool() {
        let registry = registry_with_add().await;
        let result = registry
            .execute("add", serde_json::json!({"a": 2, "b": 3}))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output, serde_json::json!(5.0));
    }

    #[tokio::test]
    async fn execute_async_tool() {
        let registry = ToolRegistry::new();
        registry
            .register_async(
                ToolMetadata::new("echo", "Echoes its input"),
                Arc::new(|args| {
                    Box::pin(async move { Ok(ToolResult::success(args)) })
                }),
            )
            .await;
        let result = registry
            .execute("echo", serde_json::json!({"msg": "hi"}))
            .await
            .unwrap();
        assert_eq!(result.output["msg"], "hi");
    }

    #[tokio::test]
    async fn missing_required_parameter_is_a_validation_error() {
        let registry = registry_with_add().await;
        let err = registry
            .execute("add", serde_json::json!({"a": 2}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing required parameter 'b'"));
    }

    #[tokio::test]
    async fn extra_properties_are_permitted() {
        let registry = registry_with_add().await;
        let result = registry
            .execute("add", serde_json::json!({"a": 1, "b": 2, "note": "extra"}))
            .await
            .unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn type_mismatch_is_rejected() {
        let registry = registry_with_add().await;
        let err = registry
            .execute("add", serde_json::json!({"a": "two", "b": 3}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expects number"));
    }

    #[tokio::test]
    async fn reregistration_replaces() {
        let registry = ToolRegistry::new();
        for answer in &[1i64, 2] {
            let answer = *answer;
            registry
                .register(
                    ToolMetadata::new("version", "Returns a number"),
                    Arc::new(move |_| Ok(ToolResult::success(serde_json::json!(answer)))),
                )
                .await;
        }
        assert_eq!(registry.list().await.len(), 1);
        let result = registry.execute("version", JsonValue::Null).await.unwrap();
        assert_eq!(result.output, serde_json::json!(2));
    }

    #[test]
    fn input_schema_shape() {
        let metadata = ToolMetadata::new("add", "Adds")
            .with_parameter(
                ToolParameter::new("a", ToolParameterType::Number)
                    .with_description("Left operand")
                    .required(),
            )
            .with_parameter(ToolParameter::new("b", ToolParameterType::Number));
        let schema = metadata.input_schema();
        assert_eq!(schema["type"], "object");
        assert_eq!(schema["properties"]["a"]["type"], "number");
        assert_eq!(schema["properties"]["a"]["description"], "Left operand");
        assert_eq!(schema["required"], serde_json::json!(["a"]));
    }
}
