//! Remote Tool Server Adapter
//!
//! Agents can reach tools hosted outside the process through a tool-server
//! session.  The transport is an external collaborator; this module fixes
//! the contract the engine consumes:
//!
//! - [`ToolServerConnector::connect`] establishes a [`ToolServerSession`]
//! - [`ToolServerSession::list_tools`] describes the server's tools
//! - [`ToolServerSession::call_tool`] invokes one and returns its content
//!
//! Framing, reconnection, and authentication are the transport's concern.
//! [`HttpToolServer`] is the reference transport: a thin JSON-over-HTTP
//! client with a TTL-cached tool catalog.

use crate::agentloop::tool_protocol::{ToolError, ToolMetadata};
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// An established session against one remote tool server.
#[async_trait]
pub trait ToolServerSession: Send + Sync {
    /// Describe the tools this server exposes.
    async fn list_tools(&self) -> Result<Vec<ToolMetadata>, Box<dyn Error + Send + Sync>>;

    /// Invoke a named tool and return its content payload.
    async fn call_tool(
        &self,
        name: &str,
        arguments: JsonValue,
    ) -> Result<JsonValue, Box<dyn Error + Send + Sync>>;
}

/// Something that can establish a [`ToolServerSession`].
#[async_trait]
pub trait ToolServerConnector: Send + Sync {
    /// Establish a session.  Implementations own reconnection policy.
    async fn connect(&self) -> Result<Arc<dyn ToolServerSession>, Box<dyn Error + Send + Sync>>;
}

/// `server name → descriptors` map rendered into prompts and searched by the
/// dispatcher.
pub type RemoteToolCatalog = HashMap<String, Vec<ToolMetadata>>;

/// Build a catalog by listing every connected session.
///
/// Servers that fail to answer are skipped with a warning rather than
/// failing the whole discovery.
pub async fn discover_remote_tools(
    sessions: &HashMap<String, Arc<dyn ToolServerSession>>,
) -> RemoteToolCatalog {
    let mut catalog = RemoteToolCatalog::new();
    for (server_name, session) in sessions {
        match session.list_tools().await {
            Ok(tools) => {
                catalog.insert(server_name.clone(), tools);
            }
            Err(e) => {
                log::warn!("tool discovery failed for server {}: {}", server_name, e);
            }
        }
    }
    catalog
}

/// Reference HTTP transport for a remote tool server.
///
/// Speaks a minimal JSON protocol: `GET {endpoint}/tools` returns the
/// descriptor list, `POST {endpoint}/call` with
/// `{"tool": name, "arguments": {...}}` invokes a tool.  The descriptor
/// list is cached with a TTL so prompt building does not hammer the server.
#[derive(Clone)]
pub struct HttpToolServer {
    endpoint: String,
    client: reqwest::Client,
    tools_cache: Arc<RwLock<Option<Vec<ToolMetadata>>>>,
    cache_ttl_secs: u64,
    last_cache_refresh: Arc<RwLock<Option<Instant>>>,
}

impl HttpToolServer {
    /// Create a transport against `endpoint` with a 30 s request timeout
    /// and a 5 minute catalog cache.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            client,
            tools_cache: Arc::new(RwLock::new(None)),
            cache_ttl_secs: 300,
            last_cache_refresh: Arc::new(RwLock::new(None)),
        })
    }

    /// Override the catalog cache TTL (in seconds).
    pub fn with_cache_ttl(mut self, ttl_secs: u64) -> Self {
        self.cache_ttl_secs = ttl_secs;
        self
    }

    async fn should_refresh_cache(&self) -> bool {
        match *self.last_cache_refresh.read().await {
            None => true,
            Some(instant) => instant.elapsed().as_secs() > self.cache_ttl_secs,
        }
    }

    async fn refresh_cache(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let response = self
            .client
            .get(format!("{}/tools", self.endpoint))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Box::new(ToolError::ProtocolError(format!(
                "tool server returned status {}",
                response.status()
            ))));
        }
        let tools: Vec<ToolMetadata> = response.json().await?;
        *self.tools_cache.write().await = Some(tools);
        *self.last_cache_refresh.write().await = Some(Instant::now());
        Ok(())
    }
}

#[async_trait]
impl ToolServerSession for HttpToolServer {
    async fn list_tools(&self) -> Result<Vec<ToolMetadata>, Box<dyn Error + Send + Sync>> {
        if self.should_refresh_cache().await {
            self.refresh_cache().await?;
        }
        Ok(self.tools_cache.read().await.clone().unwrap_or_default())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: JsonValue,
    ) -> Result<JsonValue, Box<dyn Error + Send + Sync>> {
        let response = self
            .client
            .post(format!("{}/call", self.endpoint))
            .json(&serde_json::json!({
                "tool": name,
                "arguments": arguments,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Box::new(ToolError::ProtocolError(format!(
                "tool server returned status {}",
                response.status()
            ))));
        }
        let body: JsonValue = response.json().await?;
        // Servers may wrap the payload in a "content" field.
        Ok(body.get("content").cloned().unwrap_or(body))
    }
}

#[async_trait]
impl ToolServerConnector for HttpToolServer {
    async fn connect(&self) -> Result<Arc<dyn ToolServerSession>, Box<dyn Error + Send + Sync>> {
        // Prove the server is reachable before handing out the session.
        self.refresh_cache().await?;
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agentloop::tool_protocol::ToolMetadata;

    struct StaticServer {
        tools: Vec<ToolMetadata>,
    }

    #[async_trait]
    impl ToolServerSession for StaticServer {
        async fn list_tools(&self) -> Result<Vec<ToolMetadata>, Box<dyn Error + Send + Sync>> {
            Ok(self.tools.clone())
        }

        async fn call_tool(
            &self,
            name: &str,
            _arguments: JsonValue,
        ) -> Result<JsonValue, Box<dyn Error + Send + Sync>> {
            Ok(serde_json::json!({ "called": name }))
        }
    }

    #[tokio::test]
    async fn discovery_collects_per_server_catalogs() {
        let mut sessions: HashMap<String, Arc<dyn ToolServerSession>> = HashMap::new();
        sessions.insert(
            "weather".to_string(),
            Arc::new(StaticServer {
                tools: vec![ToolMetadata::new("forecast", "Weather forecast")],
            }),
        );
        sessions.insert(
            "search".to_string(),
            Arc::new(StaticServer {
                tools: vec![
                    ToolMetadata::new("web_search", "Search the web"),
                    ToolMetadata::new("news_search", "Search news"),
                ],
            }),
        );

        let catalog = discover_remote_tools(&sessions).await;
        assert_eq!(catalog["weather"].len(), 1);
        assert_eq!(catalog["search"].len(), 2);
    }
}
