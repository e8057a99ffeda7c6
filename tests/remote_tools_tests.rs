use agentloop::config::AgentConfig;
use agentloop::llm::{LLMAdapter, LLMError, LLMResponse, Message, ToolDefinition};
use agentloop::tool_protocol::{ToolMetadata, ToolRegistry, ToolResult};
use agentloop::tool_server::ToolServerSession;
use agentloop::Agent;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

struct ScriptedClient {
    responses: Mutex<VecDeque<String>>,
}

#[async_trait]
impl LLMAdapter for ScriptedClient {
    async fn complete(
        &self,
        _messages: &[Message],
        _tools: Option<Vec<ToolDefinition>>,
    ) -> Result<LLMResponse, LLMError> {
        let content = self
            .responses
            .lock()
            .await
            .pop_front()
            .ok_or_else(|| LLMError::Provider("script exhausted".to_string()))?;
        Ok(LLMResponse {
            content,
            usage: None,
        })
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

struct GreeterServer {
    called: Arc<AtomicBool>,
}

#[async_trait]
impl ToolServerSession for GreeterServer {
    async fn list_tools(&self) -> Result<Vec<ToolMetadata>, Box<dyn Error + Send + Sync>> {
        Ok(vec![ToolMetadata::new("greet", "Greets from the server")])
    }

    async fn call_tool(
        &self,
        _name: &str,
        _arguments: JsonValue,
    ) -> Result<JsonValue, Box<dyn Error + Send + Sync>> {
        self.called.store(true, Ordering::SeqCst);
        Ok(serde_json::json!("hello from the tool server"))
    }
}

#[tokio::test]
async fn remote_tool_shadows_the_local_one() {
    let remote_called = Arc::new(AtomicBool::new(false));
    let local_called = Arc::new(AtomicBool::new(false));

    let registry = ToolRegistry::new();
    {
        let local_called = local_called.clone();
        registry
            .register(
                ToolMetadata::new("greet", "Greets locally"),
                Arc::new(move |_| {
                    local_called.store(true, Ordering::SeqCst);
                    Ok(ToolResult::success(serde_json::json!("hello from local")))
                }),
            )
            .await;
    }

    let llm = Arc::new(ScriptedClient {
        responses: Mutex::new(
            vec![
                r#"Action: {"tool": "greet", "parameters": {}}"#.to_string(),
                "Final Answer: greeted".to_string(),
            ]
            .into(),
        ),
    });

    let mut agent = Agent::new("greeter", "You greet people.", llm)
        .with_tools(Arc::new(registry))
        .with_config(AgentConfig::new("greeter"));
    agent
        .add_tool_session(
            "greeting-server",
            Arc::new(GreeterServer {
                called: remote_called.clone(),
            }),
        )
        .await
        .unwrap();

    let result = agent.run("greet me", None).await;
    assert_eq!(result.response, "greeted");

    // The remote session served the call; the local registration never ran.
    assert!(remote_called.load(Ordering::SeqCst));
    assert!(!local_called.load(Ordering::SeqCst));

    let history = agent.get_session_history(&result.session_id).await.unwrap();
    let observation = history
        .iter()
        .find(|m| m.content.starts_with("OBSERVATION"))
        .unwrap();
    assert!(observation.content.contains("hello from the tool server"));
}

#[tokio::test]
async fn remote_tools_appear_in_the_prompt_catalog() {
    // The run only succeeds if the model can name the remote tool, which in
    // turn requires the catalog to have been discovered at add time.
    let llm = Arc::new(ScriptedClient {
        responses: Mutex::new(vec!["Final Answer: ok".to_string()].into()),
    });
    let mut agent = Agent::new("greeter", "You greet people.", llm)
        .with_config(AgentConfig::new("greeter"));
    agent
        .add_tool_session(
            "greeting-server",
            Arc::new(GreeterServer {
                called: Arc::new(AtomicBool::new(false)),
            }),
        )
        .await
        .unwrap();

    let result = agent.run("hello", None).await;
    assert_eq!(result.response, "ok");
}
