//! Calculator tool: arithmetic expression evaluation for agents.
//!
//! Evaluates an expression string (`"2 + 2 * 3"`, `"(10 + 5) / 3"`,
//! `"2 ^ 10"`) and returns the numeric result.  Backed by the `evalexpr`
//! engine, so operator precedence, parentheses, and the usual math builtins
//! work out of the box.

use crate::agentloop::tool_protocol::{
    ToolMetadata, ToolParameter, ToolParameterType, ToolRegistry, ToolResult,
};
use std::sync::Arc;

/// Evaluate one expression to a number.
pub fn evaluate(expression: &str) -> Result<f64, String> {
    match evalexpr::eval(expression) {
        Ok(evalexpr::Value::Int(i)) => Ok(i as f64),
        Ok(evalexpr::Value::Float(f)) => Ok(f),
        Ok(other) => Err(format!(
            "expression did not evaluate to a number: {:?}",
            other
        )),
        Err(e) => Err(e.to_string()),
    }
}

/// Register the `calculator` tool on a registry.
pub async fn register_calculator(registry: &ToolRegistry) {
    registry
        .register(
            ToolMetadata::new(
                "calculator",
                "Evaluates a mathematical expression and returns the numeric result.",
            )
            .with_parameter(
                ToolParameter::new("expression", ToolParameterType::String)
                    .with_description("The expression to evaluate, e.g. \"2 + 2 * 3\"")
                    .required(),
            ),
            Arc::new(|args| {
                let expression = args["expression"].as_str().unwrap_or("");
                match evaluate(expression) {
                    Ok(value) => Ok(ToolResult::success(serde_json::json!(value))),
                    Err(e) => Ok(ToolResult::failure(e)),
                }
            }),
        )
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn respects_operator_precedence() {
        assert_eq!(evaluate("2 + 2 * 3").unwrap(), 8.0);
        assert_eq!(evaluate("(2 + 2) * 3").unwrap(), 12.0);
    }

    #[test]
    fn division_produces_floats() {
        assert_eq!(evaluate("7 / 2.0").unwrap(), 3.5);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(evaluate("two plus two").is_err());
    }

    #[tokio::test]
    async fn registered_tool_round_trip() {
        let registry = ToolRegistry::new();
        register_calculator(&registry).await;

        let result = registry
            .execute("calculator", serde_json::json!({"expression": "41 + 1"}))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output, serde_json::json!(42.0));

        let result = registry
            .execute("calculator", serde_json::json!({"expression": "nonsense"}))
            .await
            .unwrap();
        assert!(!result.success);
    }
}
