use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Speaker of a conversation turn. Tool results travel back on the user side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// A single tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: None,
            name: name.into(),
            arguments,
        }
    }
}

/// Outcome of a tool invocation. Failures are data, never errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocationResult {
    pub name: String,
    pub payload: Value,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolInvocationResult {
    pub fn success(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            is_error: false,
        }
    }

    pub fn failure(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: serde_json::json!({ "error": message.into() }),
            is_error: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    ToolCall(ToolCall),
    ToolResult(ToolInvocationResult),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub parts: Vec<MessagePart>,
}

impl ConversationMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![MessagePart::Text { text: text.into() }],
        }
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            parts: vec![MessagePart::Text { text: text.into() }],
        }
    }

    /// The model turn that requested a batch of calls.
    pub fn tool_calls(calls: &[ToolCall]) -> Self {
        Self {
            role: Role::Model,
            parts: calls.iter().cloned().map(MessagePart::ToolCall).collect(),
        }
    }

    /// All results of one batch, in the order the calls were requested.
    pub fn tool_results(results: &[ToolInvocationResult]) -> Self {
        Self {
            role: Role::User,
            parts: results.iter().cloned().map(MessagePart::ToolResult).collect(),
        }
    }

    /// Concatenation of all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn calls(&self) -> impl Iterator<Item = &ToolCall> + '_ {
        self.parts.iter().filter_map(|part| match part {
            MessagePart::ToolCall(call) => Some(call),
            _ => None,
        })
    }

    pub fn results(&self) -> impl Iterator<Item = &ToolInvocationResult> + '_ {
        self.parts.iter().filter_map(|part| match part {
            MessagePart::ToolResult(result) => Some(result),
            _ => None,
        })
    }
}
