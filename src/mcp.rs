//! Remote tool servers.
//!
//! [`ToolServer`] is the collaborator an agent runtime consumes for remote
//! tools. [`McpToolServer`] implements it for Model Context Protocol servers
//! reachable over HTTP JSON-RPC.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::OnceCell;

use crate::error::{PipelineError, Result};
use crate::tool::ToolDescriptor;

/// Reply from a remote tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolServerOutput {
    pub content: Value,
    pub is_error: bool,
}

#[async_trait]
pub trait ToolServer: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>>;
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolServerOutput>;
}

// ─────────────────────────────────────────────────────────────────────────────
// JSON-RPC types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    /// Absent for notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct ListToolsResult {
    tools: Vec<McpToolDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ContentItem {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image {
        #[serde(rename = "mimeType", default)]
        mime_type: Option<String>,
    },
    #[serde(rename = "resource")]
    Resource { resource: Value },
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentItem>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl CallToolResult {
    fn flatten(&self) -> String {
        self.content
            .iter()
            .map(|item| match item {
                ContentItem::Text { text } => text.clone(),
                ContentItem::Image { mime_type } => {
                    format!("[image {}]", mime_type.as_deref().unwrap_or("image/png"))
                }
                ContentItem::Resource { resource } => format!("[resource {resource}]"),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP client
// ─────────────────────────────────────────────────────────────────────────────

pub struct McpToolServer {
    http: reqwest::Client,
    url: String,
    request_id: AtomicU64,
    initialized: OnceCell<()>,
}

impl McpToolServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    pub fn with_client(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            request_id: AtomicU64::new(1),
            initialized: OnceCell::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Some(self.request_id.fetch_add(1, Ordering::SeqCst)),
            method: method.to_string(),
            params,
        };

        let response = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::ToolServer(format!("{method} request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(PipelineError::ToolServer(format!(
                "{method} returned HTTP {}",
                response.status()
            )));
        }

        let envelope: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::ToolServer(format!("{method} response unreadable: {e}")))?;

        if let Some(error) = envelope.error {
            return Err(PipelineError::ToolServer(format!(
                "{method} failed ({}): {}",
                error.code, error.message
            )));
        }
        Ok(envelope.result.unwrap_or(Value::Null))
    }

    /// Sends a JSON-RPC notification. No reply body is read.
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.to_string(),
            params,
        };
        let response = self
            .http
            .post(&self.url)
            .json(&notification)
            .send()
            .await
            .map_err(|e| PipelineError::ToolServer(format!("{method} notification failed: {e}")))?;
        if !response.status().is_success() {
            return Err(PipelineError::ToolServer(format!(
                "{method} returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn ensure_initialized(&self) -> Result<()> {
        self.initialized
            .get_or_try_init(|| async {
                self.send(
                    "initialize",
                    Some(json!({
                        "protocolVersion": "2024-11-05",
                        "capabilities": {},
                        "clientInfo": {
                            "name": "agent-pipeline",
                            "version": env!("CARGO_PKG_VERSION")
                        }
                    })),
                )
                .await?;
                if let Err(err) = self.notify("notifications/initialized", None).await {
                    tracing::debug!(error = %err, "tool server ignored initialized notification");
                }
                Ok::<(), PipelineError>(())
            })
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl ToolServer for McpToolServer {
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        self.ensure_initialized().await?;
        let result = self.send("tools/list", None).await?;
        let listed: ListToolsResult = serde_json::from_value(result)
            .map_err(|e| PipelineError::ToolServer(format!("tools/list result unreadable: {e}")))?;

        Ok(listed
            .tools
            .into_iter()
            .map(|def| {
                let description = def
                    .description
                    .unwrap_or_else(|| format!("Remote tool {}", def.name));
                ToolDescriptor::remote(def.name, description, def.input_schema)
            })
            .collect())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolServerOutput> {
        self.ensure_initialized().await?;
        let result = self
            .send(
                "tools/call",
                Some(json!({ "name": name, "arguments": arguments })),
            )
            .await?;
        let parsed: CallToolResult = serde_json::from_value(result)
            .map_err(|e| PipelineError::ToolServer(format!("tools/call result unreadable: {e}")))?;

        Ok(ToolServerOutput {
            content: json!({ "content": parsed.flatten() }),
            is_error: parsed.is_error,
        })
    }
}
