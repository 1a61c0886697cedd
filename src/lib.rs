//! Building blocks for multi-agent research pipelines.
//!
//! The crate provides:
//! - A tool-use loop (`FunctionCallLoop`) that alternates between a
//!   `LanguageModel` and the tools in a `ToolRegistry` until the model answers.
//! - An `AgentRuntime` that serves `AgentRequest`s with that loop and prices
//!   every model call.
//! - A `RemoteAgentClient` with retry and a `WorkflowCoordinator` that chains
//!   agents into a fixed sequence of stages under one correlation id.
//! - With the `server` feature, axum routers exposing both over HTTP.

mod agent;
mod config;
mod cost;
mod error;
mod function_loop;
mod hooks;
mod invoker;
mod llm;
mod mcp;
mod message;
mod prompt;
mod protocol;
mod remote;
mod retry;
#[cfg(feature = "server")]
pub mod server;
pub mod telemetry;
mod tool;
mod toolkit;
mod workflow;

pub use agent::AgentRuntime;
pub use config::{
    AgentConfig, AppConfig, LoggingConfig, ModelConfig, RemoteConfig, RetryConfig, ServerConfig,
    StageConfig, ToolServerConfig, WorkflowConfig,
};
pub use cost::{CostAccountant, CostSummary, ModelPricing, PricingTable, TokenUsage};
pub use error::{PipelineError, RemoteCallError, RemoteErrorKind, Result};
pub use function_loop::{
    FunctionCallLoop, LoopOutcome, LoopState, Termination, ToolCallRecord, DEFAULT_MAX_ITERATIONS,
};
pub use hooks::LoopHook;
pub use invoker::{ToolInvoker, DEFAULT_TOOL_TIMEOUT};
pub use llm::{model_from_config, LanguageModel, ModelCompletion, ModelUsage, OpenAIClient, StubModel};
pub use mcp::{McpToolServer, ToolServer, ToolServerOutput};
pub use message::{ConversationMessage, MessagePart, Role, ToolCall, ToolInvocationResult};
pub use prompt::PromptBuilder;
pub use protocol::{
    AgentRequest, AgentResponse, CorrelationId, ErrorBody, ErrorDetail, PriorStageResult,
    StageSummary, WorkflowInput, WorkflowResult, MAX_QUERY_CHARS,
};
pub use remote::{RemoteAgentClient, CORRELATION_HEADER};
pub use retry::{AttemptRecord, RetryFailure, RetryObserver, RetryPolicy};
pub use tool::{Tool, ToolDescriptor, ToolOrigin, ToolRegistry};
pub use toolkit::basic_toolkit;
pub use workflow::{AgentEndpoint, StageHealth, WorkflowCoordinator, WorkflowStage};
