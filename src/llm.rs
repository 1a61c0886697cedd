//! Language model implementations and abstractions.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::ModelConfig;
use crate::error::{PipelineError, Result};
use crate::message::{ConversationMessage, MessagePart, Role, ToolCall};
use crate::tool::ToolDescriptor;

/// Token counts reported by the provider for a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModelUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Result of one chat completion request: a tool-call batch, a text answer,
/// or (malformed) neither.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModelCompletion {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: ModelUsage,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Model identifier used for pricing lookups.
    fn model_id(&self) -> &str;

    async fn complete_chat(
        &self,
        messages: &[ConversationMessage],
        tools: &[ToolDescriptor],
    ) -> Result<ModelCompletion>;
}

/// Builds the provider client named in config.
pub fn model_from_config(cfg: &ModelConfig) -> Result<Arc<dyn LanguageModel>> {
    match cfg.provider.to_ascii_lowercase().as_str() {
        "openai" | "openai-compatible" => Ok(Arc::new(OpenAIClient::from_config(cfg)?)),
        other => Err(PipelineError::Config(format!(
            "unsupported model provider `{other}`"
        ))),
    }
}

fn coalesce_error(status: reqwest::StatusCode, body: &str, provider: &str) -> PipelineError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return PipelineError::LanguageModel(format!("{provider} rate limit exceeded: {body}"));
    }
    PipelineError::LanguageModel(format!("{provider} request failed with {status}: {body}"))
}

#[derive(Clone)]
pub struct OpenAIClient {
    http: reqwest::Client,
    model: String,
    api_key: String,
    base_url: String,
    organization: Option<String>,
}

impl OpenAIClient {
    pub fn from_config(cfg: &ModelConfig) -> Result<Self> {
        let api_key = cfg.api_key.clone().ok_or_else(|| {
            PipelineError::Config("missing API key in model config".into())
        })?;
        let base_url = cfg
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_millis(cfg.timeout_ms))
                .build()
                .map_err(|err| PipelineError::LanguageModel(format!("http client error: {err}")))?,
            model: cfg.model.clone(),
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            organization: cfg.organization.clone(),
        })
    }

    fn to_openai_messages(&self, messages: &[ConversationMessage]) -> Vec<Value> {
        let mut built = Vec::new();
        let mut last_calls: Vec<&ToolCall> = Vec::new();
        for message in messages {
            match message.role {
                Role::Model => {
                    last_calls = message.calls().collect();
                    let calls: Vec<Value> = message
                        .calls()
                        .enumerate()
                        .map(|(index, call)| {
                            json!({
                                "id": call_id(call, index),
                                "type": "function",
                                "function": {
                                    "name": call.name,
                                    "arguments": serde_json::to_string(&call.arguments)
                                        .unwrap_or_else(|_| call.arguments.to_string()),
                                }
                            })
                        })
                        .collect();
                    let text = message.text();
                    let mut entry = json!({ "role": "assistant" });
                    entry["content"] = if text.is_empty() { Value::Null } else { Value::String(text) };
                    if !calls.is_empty() {
                        entry["tool_calls"] = Value::Array(calls);
                    }
                    built.push(entry);
                }
                Role::User => {
                    // The result message mirrors the preceding call batch by position.
                    let mut text = Vec::new();
                    let mut index = 0;
                    for part in &message.parts {
                        match part {
                            MessagePart::Text { text: t } => text.push(t.clone()),
                            MessagePart::ToolResult(result) => {
                                let id = last_calls
                                    .get(index)
                                    .map(|call| call_id(call, index))
                                    .unwrap_or_else(|| format!("call_{index}"));
                                built.push(json!({
                                    "role": "tool",
                                    "tool_call_id": id,
                                    "content": result.payload.to_string(),
                                }));
                                index += 1;
                            }
                            MessagePart::ToolCall(_) => {}
                        }
                    }
                    if !text.is_empty() {
                        built.push(json!({ "role": "user", "content": text.join("\n") }));
                    }
                }
            }
        }
        built
    }

    fn to_openai_tools(&self, tools: &[ToolDescriptor]) -> Option<Vec<Value>> {
        if tools.is_empty() {
            return None;
        }
        Some(
            tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        }
                    })
                })
                .collect(),
        )
    }
}

fn call_id(call: &ToolCall, index: usize) -> String {
    call.id.clone().unwrap_or_else(|| format!("call_{index}"))
}

#[async_trait]
impl LanguageModel for OpenAIClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete_chat(
        &self,
        messages: &[ConversationMessage],
        tools: &[ToolDescriptor],
    ) -> Result<ModelCompletion> {
        let mut payload = json!({
            "model": self.model,
            "messages": self.to_openai_messages(messages),
        });
        if let Some(tools) = self.to_openai_tools(tools) {
            payload["tools"] = Value::Array(tools);
            payload["tool_choice"] = Value::String("auto".to_string());
        }

        let mut builder = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            );
        if let Some(org) = &self.organization {
            builder = builder.header("OpenAI-Organization", org);
        }
        let resp = builder
            .json(&payload)
            .send()
            .await
            .map_err(|err| PipelineError::LanguageModel(format!("OpenAI request error: {err}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(coalesce_error(status, &body, "openai"));
        }

        let body: OpenAiResponse = resp.json().await.map_err(|err| {
            PipelineError::LanguageModel(format!("OpenAI response parse error: {err}"))
        })?;

        let usage = body
            .usage
            .map(|u| ModelUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            })
            .unwrap_or_default();

        let Some(first) = body.choices.into_iter().next() else {
            return Ok(ModelCompletion {
                usage,
                ..ModelCompletion::default()
            });
        };

        let tool_calls = first
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| {
                let arguments = serde_json::from_str(&call.function.arguments)
                    .unwrap_or_else(|_| Value::String(call.function.arguments.clone()));
                ToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments,
                }
            })
            .collect();

        Ok(ModelCompletion {
            content: first.message.content.filter(|c| !c.trim().is_empty()),
            tool_calls,
            usage,
        })
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCall {
    #[serde(default)]
    id: Option<String>,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// A deterministic model used for tests and demos.
///
/// Each scripted response is a JSON directive:
/// - `{"action":"respond","content":"..."}`
/// - `{"action":"call_tool","name":"...","arguments":{...}}`
/// - `{"action":"call_tools","calls":[{"name":"...","arguments":{...}}, ...]}`
/// - `{"action":"empty"}` (neither text nor calls)
///
/// Anything that is not a directive is returned verbatim as text.
pub struct StubModel {
    model: String,
    responses: Mutex<VecDeque<String>>,
    usage: ModelUsage,
    seen: Mutex<Vec<Vec<ConversationMessage>>>,
}

impl StubModel {
    pub fn new(responses: Vec<String>) -> Arc<Self> {
        Arc::new(Self::scripted(responses))
    }

    pub fn scripted(responses: Vec<String>) -> Self {
        Self {
            model: "stub-model".to_string(),
            responses: Mutex::new(responses.into()),
            usage: ModelUsage {
                input_tokens: 100,
                output_tokens: 20,
            },
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_model_id(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = ModelUsage {
            input_tokens,
            output_tokens,
        };
        self
    }

    /// Number of completions served so far.
    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Message history received by each completion, in call order.
    pub fn transcripts(&self) -> Vec<Vec<ConversationMessage>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum StubDirective {
    Respond { content: String },
    CallTool { name: String, #[serde(default)] arguments: Value },
    CallTools { calls: Vec<ToolCall> },
    Empty,
}

#[async_trait]
impl LanguageModel for StubModel {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn complete_chat(
        &self,
        messages: &[ConversationMessage],
        _tools: &[ToolDescriptor],
    ) -> Result<ModelCompletion> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(messages.to_vec());
        let raw = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| {
                PipelineError::LanguageModel("StubModel ran out of scripted responses".into())
            })?;

        let (content, tool_calls) = match serde_json::from_str::<StubDirective>(&raw) {
            Ok(StubDirective::Respond { content }) => (Some(content), Vec::new()),
            Ok(StubDirective::CallTool { name, arguments }) => {
                (None, vec![ToolCall::new(name, arguments)])
            }
            Ok(StubDirective::CallTools { calls }) => (None, calls),
            Ok(StubDirective::Empty) => (None, Vec::new()),
            Err(_) => (Some(raw), Vec::new()),
        };
        Ok(ModelCompletion {
            content,
            tool_calls,
            usage: self.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolInvocationResult;

    fn client() -> OpenAIClient {
        OpenAIClient::from_config(&ModelConfig {
            provider: "openai".into(),
            model: "gpt-4o-mini".into(),
            api_key: Some("sk-test".into()),
            base_url: Some("http://localhost:1/v1/".into()),
            organization: None,
            timeout_ms: 1_000,
        })
        .unwrap()
    }

    #[test]
    fn maps_call_batch_and_results_by_position() {
        let calls = vec![
            ToolCall {
                id: Some("abc".into()),
                name: "search".into(),
                arguments: json!({"q": "rust"}),
            },
            ToolCall::new("summarize", json!({})),
        ];
        let history = vec![
            ConversationMessage::user_text("hi"),
            ConversationMessage::tool_calls(&calls),
            ConversationMessage::tool_results(&[
                ToolInvocationResult::failure("search", "offline"),
                ToolInvocationResult::success("summarize", json!("ok")),
            ]),
        ];

        let built = client().to_openai_messages(&history);
        assert_eq!(built.len(), 4);
        assert_eq!(built[0]["role"], "user");
        assert_eq!(built[1]["role"], "assistant");
        assert_eq!(built[1]["tool_calls"][0]["id"], "abc");
        assert_eq!(built[1]["tool_calls"][1]["id"], "call_1");
        assert_eq!(built[2]["tool_call_id"], "abc");
        assert_eq!(built[3]["tool_call_id"], "call_1");
    }

    #[test]
    fn unknown_provider_is_a_config_error() {
        let cfg = ModelConfig {
            provider: "carrier-pigeon".into(),
            ..ModelConfig::default()
        };
        assert!(matches!(model_from_config(&cfg), Err(PipelineError::Config(_))));
    }

    #[tokio::test]
    async fn stub_model_serves_directives_in_order() {
        let model = StubModel::new(vec![
            r#"{"action":"call_tools","calls":[{"name":"a"},{"name":"b","arguments":{"x":1}}]}"#
                .into(),
            r#"{"action":"respond","content":"done"}"#.into(),
        ]);

        let first = model.complete_chat(&[], &[]).await.unwrap();
        assert_eq!(first.tool_calls.len(), 2);
        assert_eq!(first.tool_calls[1].arguments, json!({"x": 1}));

        let second = model.complete_chat(&[], &[]).await.unwrap();
        assert_eq!(second.content.as_deref(), Some("done"));
        assert_eq!(model.calls(), 2);
        assert!(model.complete_chat(&[], &[]).await.is_err());
    }
}
