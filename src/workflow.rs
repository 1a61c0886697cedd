use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::Instrument;

use crate::cost::TokenUsage;
use crate::error::{PipelineError, Result};
use crate::protocol::{
    AgentRequest, AgentResponse, CorrelationId, PriorStageResult, StageSummary, WorkflowInput,
    WorkflowResult,
};

/// Something that can serve one pipeline stage: a peer over the network or
/// an in-process runtime.
#[async_trait]
pub trait AgentEndpoint: Send + Sync {
    async fn call(&self, request: AgentRequest, deadline: Option<Instant>) -> Result<AgentResponse>;

    /// Never fails; an unreachable endpoint is simply unhealthy.
    async fn health_check(&self) -> bool;
}

#[derive(Clone)]
pub struct WorkflowStage {
    pub name: String,
    endpoint: Arc<dyn AgentEndpoint>,
}

impl WorkflowStage {
    pub fn new(name: impl Into<String>, endpoint: Arc<dyn AgentEndpoint>) -> Self {
        Self {
            name: name.into(),
            endpoint,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageHealth {
    pub stage: String,
    pub healthy: bool,
}

/// Runs a fixed list of stages one after another. Every stage sees the
/// original query and context plus the raw results of all earlier stages.
#[derive(Clone)]
pub struct WorkflowCoordinator {
    name: String,
    stages: Vec<WorkflowStage>,
    deadline: Option<Duration>,
}

impl WorkflowCoordinator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            deadline: None,
        }
    }

    pub fn with_stage(mut self, name: impl Into<String>, endpoint: Arc<dyn AgentEndpoint>) -> Self {
        self.stages.push(WorkflowStage::new(name, endpoint));
        self
    }

    /// Budget for a whole `execute` call, shared across all stages.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    pub async fn execute(&self, input: WorkflowInput) -> Result<WorkflowResult> {
        let deadline = self.deadline.map(|budget| Instant::now() + budget);
        self.execute_until(input, deadline).await
    }

    pub async fn execute_until(
        &self,
        input: WorkflowInput,
        deadline: Option<Instant>,
    ) -> Result<WorkflowResult> {
        let correlation_id = CorrelationId::sanitize(input.correlation_id.as_deref());
        let span = tracing::info_span!(
            "workflow",
            correlation_id = %correlation_id,
            workflow = %self.name
        );
        self.run_stages(correlation_id, input, deadline)
            .instrument(span)
            .await
    }

    async fn run_stages(
        &self,
        correlation_id: CorrelationId,
        input: WorkflowInput,
        deadline: Option<Instant>,
    ) -> Result<WorkflowResult> {
        if self.stages.is_empty() {
            return Err(PipelineError::Validation(format!(
                "workflow `{}` has no stages",
                self.name
            )));
        }
        let mut base = AgentRequest::new(input.query).with_correlation_id(correlation_id.clone());
        if let Some(context) = input.context {
            base = base.with_context(context);
        }
        base.validate()?;

        let started = Instant::now();
        let mut completed: Vec<StageSummary> = Vec::with_capacity(self.stages.len());
        let mut prior: Vec<PriorStageResult> = Vec::with_capacity(self.stages.len());

        for stage in &self.stages {
            tracing::info!(stage = %stage.name, "stage starting");
            let request = base.clone().with_previous_results(prior.clone());
            let response = match stage.endpoint.call(request, deadline).await {
                Ok(response) => response,
                Err(err) => {
                    tracing::error!(stage = %stage.name, error = %err, "stage failed");
                    return Err(PipelineError::StageFailure {
                        stage: stage.name.clone(),
                        correlation_id: correlation_id.to_string(),
                        completed,
                        elapsed: started.elapsed(),
                        source: Box::new(err),
                    });
                }
            };
            if response.correlation_id != correlation_id {
                tracing::warn!(
                    stage = %stage.name,
                    returned = %response.correlation_id,
                    "stage answered with a different correlation id"
                );
            }
            tracing::info!(
                stage = %stage.name,
                execution_time_ms = response.execution_time,
                total_tokens = response.token_usage.total_tokens,
                "stage complete"
            );
            prior.push(PriorStageResult::new(stage.name.clone(), response.result.clone()));
            completed.push(StageSummary::from_response(stage.name.clone(), &response));
        }

        let token_usage: TokenUsage = completed.iter().map(|s| &s.token_usage).sum();
        let result = completed
            .last()
            .map(|s| s.result.clone())
            .unwrap_or_default();
        Ok(WorkflowResult {
            correlation_id,
            workflow: self.name.clone(),
            result,
            stages: completed,
            token_usage,
            total_execution_time: started.elapsed().as_millis() as u64,
        })
    }

    /// Probes every stage concurrently.
    pub async fn health(&self) -> Vec<StageHealth> {
        let probes = self.stages.iter().map(|stage| async move {
            StageHealth {
                stage: stage.name.clone(),
                healthy: stage.endpoint.health_check().await,
            }
        });
        join_all(probes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use serde_json::json;

    /// Echoes what it saw so tests can inspect the threading of prior results.
    struct Scripted {
        agent: String,
        fail: bool,
        seen: Mutex<Vec<AgentRequest>>,
    }

    impl Scripted {
        fn ok(agent: &str) -> Arc<Self> {
            Arc::new(Self {
                agent: agent.into(),
                fail: false,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn failing(agent: &str) -> Arc<Self> {
            Arc::new(Self {
                agent: agent.into(),
                fail: true,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl AgentEndpoint for Scripted {
        async fn call(&self, request: AgentRequest, _deadline: Option<Instant>) -> Result<AgentResponse> {
            self.seen.lock().unwrap().push(request.clone());
            if self.fail {
                return Err(PipelineError::LanguageModel("provider down".into()));
            }
            Ok(AgentResponse {
                correlation_id: request.correlation_id.clone(),
                agent: self.agent.clone(),
                result: format!("{} saw {} prior", self.agent, request.previous_results.len()),
                execution_time: 5,
                token_usage: TokenUsage::new(100, 50, 0.25),
                tools_used: vec!["search".into()],
                iteration_count: 2,
            })
        }

        async fn health_check(&self) -> bool {
            !self.fail
        }
    }

    #[tokio::test]
    async fn threads_results_and_aggregates_usage() {
        let research = Scripted::ok("research");
        let analysis = Scripted::ok("analysis");
        let writer = Scripted::ok("writer");
        let coordinator = WorkflowCoordinator::new("research")
            .with_stage("research", research.clone())
            .with_stage("analysis", analysis.clone())
            .with_stage("writer", writer.clone());

        let id = CorrelationId::new();
        let mut context = BTreeMap::new();
        context.insert("audience".to_string(), json!("engineers"));
        let result = coordinator
            .execute(
                WorkflowInput::new("state of async rust")
                    .with_correlation_id(id.as_str())
                    .with_context(context),
            )
            .await
            .unwrap();

        assert_eq!(result.correlation_id, id);
        assert_eq!(result.result, "writer saw 2 prior");
        assert_eq!(result.stages.len(), 3);
        assert!(result.stages.iter().all(|s| s.success));
        assert_eq!(result.token_usage.input_tokens, 300);
        assert_eq!(result.token_usage.output_tokens, 150);
        assert_eq!(result.token_usage.total_tokens, 450);
        assert_eq!(result.token_usage.estimated_cost(), 0.75);

        let last = writer.seen.lock().unwrap()[0].clone();
        assert_eq!(last.correlation_id, id);
        assert_eq!(last.query, "state of async rust");
        assert_eq!(last.context.as_ref().unwrap()["audience"], json!("engineers"));
        let stages: Vec<&str> = last.previous_results.iter().map(|p| p.stage.as_str()).collect();
        assert_eq!(stages, vec!["research", "analysis"]);
        assert_eq!(last.previous_results[0].result, "research saw 0 prior");
    }

    #[tokio::test]
    async fn stage_failure_keeps_completed_summaries() {
        let writer = Scripted::ok("writer");
        let coordinator = WorkflowCoordinator::new("research")
            .with_stage("research", Scripted::ok("research"))
            .with_stage("analysis", Scripted::failing("analysis"))
            .with_stage("writer", writer.clone());

        let err = coordinator
            .execute(WorkflowInput::new("anything"))
            .await
            .unwrap_err();

        match err {
            PipelineError::StageFailure {
                stage,
                completed,
                correlation_id,
                source,
                ..
            } => {
                assert_eq!(stage, "analysis");
                assert_eq!(completed.len(), 1);
                assert_eq!(completed[0].stage, "research");
                assert!(CorrelationId::is_valid(&correlation_id));
                assert!(matches!(*source, PipelineError::LanguageModel(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(writer.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_correlation_id_is_replaced() {
        let coordinator = WorkflowCoordinator::new("single").with_stage("only", Scripted::ok("only"));
        let result = coordinator
            .execute(WorkflowInput::new("q").with_correlation_id("not-a-uuid"))
            .await
            .unwrap();
        assert_ne!(result.correlation_id.as_str(), "not-a-uuid");
        assert!(CorrelationId::is_valid(result.correlation_id.as_str()));
    }

    #[tokio::test]
    async fn empty_query_fails_before_any_stage() {
        let stage = Scripted::ok("only");
        let coordinator = WorkflowCoordinator::new("single").with_stage("only", stage.clone());
        let err = coordinator.execute(WorkflowInput::new("  ")).await.unwrap_err();
        assert!(err.is_validation());
        assert!(stage.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn health_reports_each_stage() {
        let coordinator = WorkflowCoordinator::new("research")
            .with_stage("research", Scripted::ok("research"))
            .with_stage("analysis", Scripted::failing("analysis"));
        let health = coordinator.health().await;
        assert_eq!(
            health,
            vec![
                StageHealth {
                    stage: "research".into(),
                    healthy: true
                },
                StageHealth {
                    stage: "analysis".into(),
                    healthy: false
                },
            ]
        );
    }
}
