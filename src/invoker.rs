use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;

use crate::mcp::ToolServer;
use crate::message::ToolInvocationResult;
use crate::tool::{ToolOrigin, ToolRegistry};

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Dispatches named calls against a catalog. Every failure comes back as an
/// `is_error` result; `invoke` has no error path.
#[derive(Clone)]
pub struct ToolInvoker {
    registry: Arc<ToolRegistry>,
    server: Option<Arc<dyn ToolServer>>,
    remote_timeout: Duration,
}

impl ToolInvoker {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            server: None,
            remote_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    pub fn with_server(mut self, server: Arc<dyn ToolServer>) -> Self {
        self.server = Some(server);
        self
    }

    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub async fn invoke(&self, name: &str, args: Value) -> ToolInvocationResult {
        let descriptor = match self.registry.resolve(name) {
            Ok(descriptor) => descriptor,
            Err(_) => {
                tracing::warn!(tool = %name, "model requested an unknown tool");
                return ToolInvocationResult::failure(name, "tool not found");
            }
        };

        let result = match descriptor.origin {
            ToolOrigin::Local => self.invoke_local(name, args).await,
            ToolOrigin::Remote => self.invoke_remote(name, args).await,
        };
        if result.is_error {
            tracing::debug!(tool = %name, payload = %result.payload, "tool call failed");
        }
        result
    }

    async fn invoke_local(&self, name: &str, args: Value) -> ToolInvocationResult {
        let Some(tool) = self.registry.executor(name) else {
            return ToolInvocationResult::failure(name, "tool not found");
        };
        match AssertUnwindSafe(tool.call(args)).catch_unwind().await {
            Ok(Ok(payload)) => ToolInvocationResult::success(name, payload),
            Ok(Err(err)) => ToolInvocationResult::failure(name, err.to_string()),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "tool panicked".to_string());
                ToolInvocationResult::failure(name, format!("tool panicked: {message}"))
            }
        }
    }

    async fn invoke_remote(&self, name: &str, args: Value) -> ToolInvocationResult {
        let Some(server) = &self.server else {
            return ToolInvocationResult::failure(name, "no tool server connected");
        };
        match tokio::time::timeout(self.remote_timeout, server.call_tool(name, args)).await {
            Ok(Ok(output)) => ToolInvocationResult {
                name: name.to_string(),
                payload: output.content,
                is_error: output.is_error,
            },
            Ok(Err(err)) => ToolInvocationResult::failure(name, err.to_string()),
            Err(_) => ToolInvocationResult::failure(
                name,
                format!("tool timed out after {}ms", self.remote_timeout.as_millis()),
            ),
        }
    }
}
