use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{PipelineError, Result};
use crate::tool::{Tool, ToolRegistry};

/// General-purpose local tools available to every agent.
pub fn basic_toolkit() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for tool in [
        Arc::new(EchoTool) as Arc<dyn Tool>,
        Arc::new(WordCountTool),
        Arc::new(JsonPickTool),
    ] {
        if let Err(err) = registry.register_shared(tool) {
            tracing::warn!(error = %err, "skipping toolkit entry");
        }
    }
    registry
}

struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the provided JSON payload back to the caller."
    }

    async fn call(&self, input: Value) -> Result<Value> {
        Ok(input)
    }
}

struct WordCountTool;

#[async_trait]
impl Tool for WordCountTool {
    fn name(&self) -> &str {
        "word_count"
    }

    fn description(&self) -> &str {
        "Count words, lines and characters. Expects {\"text\": string}."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    async fn call(&self, input: Value) -> Result<Value> {
        let text = input
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid(self.name(), "missing `text`"))?;
        Ok(json!({
            "words": text.split_whitespace().count(),
            "lines": text.lines().count(),
            "characters": text.chars().count(),
        }))
    }
}

struct JsonPickTool;

#[async_trait]
impl Tool for JsonPickTool {
    fn name(&self) -> &str {
        "json_pick"
    }

    fn description(&self) -> &str {
        "Extract a value from a JSON document by dotted path (array indices allowed). \
         Expects {\"document\": any, \"path\": string}."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "document": {},
                "path": { "type": "string" }
            },
            "required": ["document", "path"]
        })
    }

    async fn call(&self, input: Value) -> Result<Value> {
        let path = input
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid(self.name(), "missing `path`"))?;
        let document = input
            .get("document")
            .ok_or_else(|| invalid(self.name(), "missing `document`"))?;

        let mut current = document;
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            let next = match current {
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                Value::Object(map) => map.get(segment),
                _ => None,
            };
            current = next.ok_or_else(|| invalid(self.name(), &format!("no value at `{segment}`")))?;
        }
        Ok(json!({ "path": path, "value": current }))
    }
}

fn invalid(tool: &str, message: &str) -> PipelineError {
    PipelineError::ToolExecution {
        name: tool.to_string(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn toolkit_registers_all_tools() {
        let registry = basic_toolkit();
        assert_eq!(registry.names(), vec!["echo", "word_count", "json_pick"]);
    }

    #[tokio::test]
    async fn counts_words() {
        let out = WordCountTool
            .call(json!({ "text": "one two\nthree" }))
            .await
            .unwrap();
        assert_eq!(out, json!({ "words": 3, "lines": 2, "characters": 13 }));
    }

    #[tokio::test]
    async fn picks_nested_values() {
        let doc = json!({ "papers": [{ "title": "A" }, { "title": "B" }] });
        let out = JsonPickTool
            .call(json!({ "document": doc.clone(), "path": "papers.1.title" }))
            .await
            .unwrap();
        assert_eq!(out["value"], json!("B"));

        let err = JsonPickTool
            .call(json!({ "document": doc, "path": "papers.9" }))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ToolExecution { .. }));
    }
}
