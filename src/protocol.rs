//! Wire payloads exchanged between the coordinator and agent runtimes.
//!
//! Every payload is JSON with camelCase field names.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::cost::TokenUsage;
use crate::error::{PipelineError, Result};

pub const MAX_QUERY_CHARS: usize = 10_000;

/// Trace token threaded through one logical request. Always a UUID v4.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn is_valid(raw: &str) -> bool {
        Uuid::parse_str(raw)
            .map(|id| id.get_version_num() == 4)
            .unwrap_or(false)
    }

    /// Keeps a well-formed id and replaces a missing or malformed one.
    pub fn sanitize(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some(candidate) if Self::is_valid(candidate) => Self(candidate.to_ascii_lowercase()),
            Some(candidate) => {
                let fresh = Self::new();
                tracing::debug!(rejected = %candidate, replacement = %fresh, "replacing invalid correlation id");
                fresh
            }
            None => Self::new(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn normalized(&self) -> Self {
        Self::sanitize(Some(&self.0))
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriorStageResult {
    pub stage: String,
    pub result: String,
}

impl PriorStageResult {
    pub fn new(stage: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            result: result.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    #[serde(default)]
    pub correlation_id: CorrelationId,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<BTreeMap<String, Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous_results: Vec<PriorStageResult>,
}

impl AgentRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            query: query.into(),
            context: None,
            previous_results: Vec::new(),
        }
    }

    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = id;
        self
    }

    pub fn with_context(mut self, context: BTreeMap<String, Value>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_context_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value);
        self
    }

    pub fn with_previous_results(mut self, results: Vec<PriorStageResult>) -> Self {
        self.previous_results = results;
        self
    }

    /// Boundary normalization: replaces an invalid correlation id.
    pub fn normalize(&mut self) {
        self.correlation_id = self.correlation_id.normalized();
    }

    pub fn validate(&self) -> Result<()> {
        let query = self.query.trim();
        if query.is_empty() {
            return Err(PipelineError::Validation("query must not be empty".into()));
        }
        let chars = self.query.chars().count();
        if chars > MAX_QUERY_CHARS {
            return Err(PipelineError::Validation(format!(
                "query is {chars} characters, limit is {MAX_QUERY_CHARS}"
            )));
        }
        if let Some(index) = self
            .previous_results
            .iter()
            .position(|prior| prior.stage.trim().is_empty())
        {
            return Err(PipelineError::Validation(format!(
                "previousResults[{index}] has an empty stage name"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResponse {
    pub correlation_id: CorrelationId,
    #[serde(default)]
    pub agent: String,
    pub result: String,
    /// Milliseconds.
    pub execution_time: u64,
    pub token_usage: TokenUsage,
    #[serde(default)]
    pub tools_used: Vec<String>,
    pub iteration_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<BTreeMap<String, Value>>,
}

impl WorkflowInput {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            correlation_id: None,
            query: query.into(),
            context: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_context(mut self, context: BTreeMap<String, Value>) -> Self {
        self.context = Some(context);
        self
    }
}

/// Per-stage record kept in a workflow result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSummary {
    pub stage: String,
    pub agent: String,
    pub result: String,
    pub execution_time: u64,
    pub token_usage: TokenUsage,
    pub tools_used: Vec<String>,
    pub iteration_count: usize,
    pub success: bool,
}

impl StageSummary {
    pub fn from_response(stage: impl Into<String>, response: &AgentResponse) -> Self {
        Self {
            stage: stage.into(),
            agent: response.agent.clone(),
            result: response.result.clone(),
            execution_time: response.execution_time,
            token_usage: response.token_usage,
            tools_used: response.tools_used.clone(),
            iteration_count: response.iteration_count,
            success: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResult {
    pub correlation_id: CorrelationId,
    pub workflow: String,
    pub result: String,
    pub stages: Vec<StageSummary>,
    pub token_usage: TokenUsage,
    /// Milliseconds.
    pub total_execution_time: u64,
}

/// Structured error body returned with non-success statuses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl ErrorBody {
    pub fn new(
        kind: impl Into<String>,
        message: impl Into<String>,
        correlation_id: Option<&CorrelationId>,
    ) -> Self {
        Self {
            error: ErrorDetail {
                kind: kind.into(),
                message: message.into(),
                correlation_id: correlation_id.map(|id| id.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keeps_valid_v4_ids() {
        let raw = "3f2b8c1e-9d4a-4c7b-8e2f-1a2b3c4d5e6f";
        assert_eq!(CorrelationId::sanitize(Some(raw)).as_str(), raw);
    }

    #[test]
    fn replaces_missing_or_malformed_ids() {
        let fresh = CorrelationId::sanitize(None);
        assert!(CorrelationId::is_valid(fresh.as_str()));

        let replaced = CorrelationId::sanitize(Some("not-a-uuid"));
        assert_ne!(replaced.as_str(), "not-a-uuid");
        assert!(CorrelationId::is_valid(replaced.as_str()));

        // v1 layout: right shape, wrong version.
        let v1 = "c232ab00-9414-11ec-b3c8-9f6bdeced846";
        assert_ne!(CorrelationId::sanitize(Some(v1)).as_str(), v1);
    }

    #[test]
    fn request_without_id_gets_one_on_deserialize() {
        let request: AgentRequest = serde_json::from_value(json!({ "query": "hi" })).unwrap();
        assert!(CorrelationId::is_valid(request.correlation_id.as_str()));
    }

    #[test]
    fn normalize_replaces_invalid_wire_id() {
        let mut request: AgentRequest =
            serde_json::from_value(json!({ "correlationId": "bogus", "query": "hi" })).unwrap();
        request.normalize();
        assert!(CorrelationId::is_valid(request.correlation_id.as_str()));
    }

    #[test]
    fn validation_rejects_blank_and_oversized_queries() {
        assert!(AgentRequest::new("   ").validate().unwrap_err().is_validation());
        let long = "x".repeat(MAX_QUERY_CHARS + 1);
        assert!(AgentRequest::new(long).validate().is_err());
        assert!(AgentRequest::new("fine").validate().is_ok());

        let bad_prior = AgentRequest::new("q")
            .with_previous_results(vec![PriorStageResult::new(" ", "r")]);
        assert!(bad_prior.validate().is_err());
    }

    #[test]
    fn uses_camel_case_on_the_wire() {
        let request = AgentRequest::new("q")
            .with_previous_results(vec![PriorStageResult::new("research", "found")]);
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("correlationId").is_some());
        assert_eq!(value["previousResults"][0]["stage"], "research");
    }
}
