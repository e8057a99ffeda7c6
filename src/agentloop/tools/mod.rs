//! Built-in Local Tools
//!
//! Ready-made tools that can be registered onto any
//! [`ToolRegistry`](crate::agentloop::tool_protocol::ToolRegistry).
//! Currently ships a calculator; applications register their own tools the
//! same way.

pub mod calculator;

pub use calculator::register_calculator;
