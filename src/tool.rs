use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{PipelineError, Result};

/// A locally executed capability the model can call.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    /// JSON Schema for the arguments. Defaults to an unconstrained object.
    fn parameters(&self) -> Value {
        json!({ "type": "object" })
    }

    async fn call(&self, input: Value) -> Result<Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolOrigin {
    Local,
    Remote,
}

/// Catalog entry sent verbatim to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub origin: ToolOrigin,
}

impl ToolDescriptor {
    pub fn remote(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            origin: ToolOrigin::Remote,
        }
    }
}

/// Ordered catalog of local and remote tools.
///
/// Names are unique. When names collide:
/// - a second local registration is rejected with [`PipelineError::DuplicateTool`];
/// - a remote descriptor whose name is already taken is skipped, so local
///   tools always win and the first remote descriptor wins over later ones.
///
/// The catalog lists locals in registration order followed by merged remotes
/// in the order they were supplied.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    catalog: Vec<ToolDescriptor>,
    executors: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_local<T: Tool + 'static>(&mut self, tool: T) -> Result<()> {
        self.register_shared(Arc::new(tool))
    }

    pub fn register_shared(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.name().to_string();
        if self.contains(&name) {
            return Err(PipelineError::DuplicateTool(name));
        }
        self.catalog.push(ToolDescriptor {
            name: name.clone(),
            description: tool.description().to_string(),
            parameters: tool.parameters(),
            origin: ToolOrigin::Local,
        });
        self.executors.insert(name, tool);
        Ok(())
    }

    /// Adds remote descriptors under the collision policy and returns the merged catalog.
    pub fn merge_remote(
        &mut self,
        descriptors: impl IntoIterator<Item = ToolDescriptor>,
    ) -> &[ToolDescriptor] {
        for mut descriptor in descriptors {
            if self.contains(&descriptor.name) {
                tracing::warn!(tool = %descriptor.name, "remote tool shadowed by an existing tool, skipping");
                continue;
            }
            descriptor.origin = ToolOrigin::Remote;
            self.catalog.push(descriptor);
        }
        &self.catalog
    }

    pub fn resolve(&self, name: &str) -> Result<&ToolDescriptor> {
        self.catalog
            .iter()
            .find(|descriptor| descriptor.name == name)
            .ok_or_else(|| PipelineError::ToolNotFound(name.to_string()))
    }

    pub fn executor(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.executors.get(name).cloned()
    }

    pub fn catalog(&self) -> &[ToolDescriptor] {
        &self.catalog
    }

    pub fn contains(&self, name: &str) -> bool {
        self.catalog.iter().any(|descriptor| descriptor.name == name)
    }

    /// Number of catalog entries served by the tool server.
    pub fn remote_count(&self) -> usize {
        self.catalog
            .iter()
            .filter(|descriptor| descriptor.origin == ToolOrigin::Remote)
            .count()
    }

    pub fn names(&self) -> Vec<String> {
        self.catalog.iter().map(|d| d.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.catalog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty()
    }
}
