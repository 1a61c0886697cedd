use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cost::TokenUsage;
use crate::protocol::StageSummary;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("tool `{0}` not found")]
    ToolNotFound(String),

    #[error("tool `{0}` is already registered")]
    DuplicateTool(String),

    #[error("tool `{name}` invocation failed: {message}")]
    ToolExecution { name: String, message: String },

    #[error("model returned neither text nor tool calls: {0}")]
    MalformedResponse(String),

    #[error("iteration budget of {max} model turns exhausted without a final answer")]
    IterationBudgetExceeded { max: usize },

    #[error("deadline exceeded after {elapsed:?}")]
    DeadlineExceeded { elapsed: Duration },

    #[error("language model error: {0}")]
    LanguageModel(String),

    #[error("tool server error: {0}")]
    ToolServer(String),

    #[error(transparent)]
    RemoteCall(#[from] RemoteCallError),

    #[error("agent run {correlation_id} failed after {elapsed:?}: {source}")]
    Agent {
        correlation_id: String,
        elapsed: Duration,
        token_usage: TokenUsage,
        #[source]
        source: Box<PipelineError>,
    },

    #[error(
        "workflow {correlation_id} failed at stage `{stage}` after {} completed stage(s): {source}",
        .completed.len()
    )]
    StageFailure {
        stage: String,
        correlation_id: String,
        completed: Vec<StageSummary>,
        elapsed: Duration,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

impl PipelineError {
    /// Strips `Agent` wrappers and returns the failure that actually ended the run.
    pub fn root_cause(&self) -> &PipelineError {
        match self {
            PipelineError::Agent { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Short machine-readable tag, used in structured error bodies.
    pub fn kind(&self) -> &'static str {
        match self.root_cause() {
            PipelineError::Validation(_) => "validation",
            PipelineError::ToolNotFound(_) => "tool_not_found",
            PipelineError::DuplicateTool(_) => "duplicate_tool",
            PipelineError::ToolExecution { .. } => "tool_execution",
            PipelineError::MalformedResponse(_) => "malformed_response",
            PipelineError::IterationBudgetExceeded { .. } => "iteration_budget_exceeded",
            PipelineError::DeadlineExceeded { .. } => "deadline_exceeded",
            PipelineError::LanguageModel(_) => "language_model",
            PipelineError::ToolServer(_) => "tool_server",
            PipelineError::RemoteCall(_) => "remote_call",
            PipelineError::StageFailure { .. } => "stage_failure",
            PipelineError::Config(_) => "config",
            PipelineError::Io(_) => "io",
            PipelineError::Serde(_) => "serde",
            PipelineError::Agent { .. } => "agent",
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self.root_cause(), PipelineError::Validation(_))
    }

    pub fn is_timeout(&self) -> bool {
        match self.root_cause() {
            PipelineError::DeadlineExceeded { .. } => true,
            PipelineError::RemoteCall(err) => err.kind == RemoteErrorKind::Timeout,
            _ => false,
        }
    }
}

/// Failure classes for calls to a peer agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    Timeout,
    Connection,
    RateLimited,
    ServerBusy,
    Validation,
    Client,
    Server,
    Decode,
}

impl RemoteErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            RemoteErrorKind::Timeout
                | RemoteErrorKind::Connection
                | RemoteErrorKind::RateLimited
                | RemoteErrorKind::ServerBusy
        )
    }

    /// Maps an HTTP status to a failure class.
    pub fn from_status(status: u16) -> Self {
        match status {
            400 | 422 => RemoteErrorKind::Validation,
            408 => RemoteErrorKind::Timeout,
            429 => RemoteErrorKind::RateLimited,
            502..=504 => RemoteErrorKind::ServerBusy,
            400..=499 => RemoteErrorKind::Client,
            _ => RemoteErrorKind::Server,
        }
    }
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RemoteErrorKind::Timeout => "timeout",
            RemoteErrorKind::Connection => "connection",
            RemoteErrorKind::RateLimited => "rate limited",
            RemoteErrorKind::ServerBusy => "server busy",
            RemoteErrorKind::Validation => "validation",
            RemoteErrorKind::Client => "client error",
            RemoteErrorKind::Server => "server error",
            RemoteErrorKind::Decode => "decode",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("remote call failed ({kind}) after {attempts} attempt(s): {message}")]
pub struct RemoteCallError {
    pub kind: RemoteErrorKind,
    pub message: String,
    pub status: Option<u16>,
    pub attempts: u32,
}

impl RemoteCallError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            attempts: 1,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            RemoteErrorKind::Timeout
        } else if err.is_decode() {
            RemoteErrorKind::Decode
        } else if let Some(status) = err.status() {
            RemoteErrorKind::from_status(status.as_u16())
        } else {
            RemoteErrorKind::Connection
        };
        let mut built = Self::new(kind, err.to_string());
        built.status = err.status().map(|s| s.as_u16());
        built
    }
}
