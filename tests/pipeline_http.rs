#![cfg(feature = "server")]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_pipeline::server::{agent_router, coordinator_router, spawn};
use agent_pipeline::{
    basic_toolkit, AgentRuntime, CorrelationId, ErrorBody, PipelineError, RemoteAgentClient,
    RemoteErrorKind, RetryPolicy, StubModel, WorkflowCoordinator, WorkflowInput, WorkflowResult,
    CORRELATION_HEADER,
};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use serde_json::json;

fn respond(text: &str) -> String {
    json!({ "action": "respond", "content": text }).to_string()
}

async fn serve_agent(name: &str, script: Vec<String>) -> String {
    let runtime = AgentRuntime::new(name, StubModel::new(script))
        .with_role_prompt(format!("You are the {name} agent."))
        .with_tools(basic_toolkit());
    let (addr, _handle) = spawn(agent_router(Arc::new(runtime)), "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    format!("http://{addr}")
}

fn client(base: String) -> Arc<RemoteAgentClient> {
    Arc::new(RemoteAgentClient::new(base).with_retry_policy(RetryPolicy {
        max_retries: 1,
        min_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        factor: 2.0,
    }))
}

#[tokio::test]
async fn workflow_runs_across_http_agents() {
    let research = serve_agent(
        "research",
        vec![
            json!({
                "action": "call_tool",
                "name": "word_count",
                "arguments": { "text": "three short words" }
            })
            .to_string(),
            respond("found 3 words"),
        ],
    )
    .await;
    let writer = serve_agent("writer", vec![respond("final report")]).await;

    let coordinator = WorkflowCoordinator::new("research")
        .with_stage("research", client(research))
        .with_stage("writer", client(writer));
    let (addr, _handle) = spawn(
        coordinator_router(Arc::new(coordinator)),
        "127.0.0.1:0".parse().unwrap(),
    )
    .await
    .unwrap();

    let id = CorrelationId::new();
    let response = reqwest::Client::new()
        .post(format!("http://{addr}/workflow"))
        .header(CORRELATION_HEADER, id.as_str())
        .json(&json!({ "query": "count the words" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()[CORRELATION_HEADER].to_str().unwrap(),
        id.as_str()
    );
    let result: WorkflowResult = response.json().await.unwrap();
    assert_eq!(result.correlation_id, id);
    assert_eq!(result.result, "final report");
    assert_eq!(result.stages.len(), 2);
    assert_eq!(result.stages[0].tools_used, vec!["word_count"]);
    assert_eq!(result.stages[0].iteration_count, 2);
    // three model calls at 100 in / 20 out each
    assert_eq!(result.token_usage.input_tokens, 300);
    assert_eq!(result.token_usage.output_tokens, 60);
    assert_eq!(result.token_usage.total_tokens, 360);

    let health: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["stages"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn agent_rejects_empty_query_with_structured_error() {
    let base = serve_agent("research", vec![respond("never")]).await;
    let id = CorrelationId::new();

    let response = reqwest::Client::new()
        .post(format!("{base}/process"))
        .json(&json!({ "correlationId": id.as_str(), "query": "   " }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
    assert_eq!(
        response.headers()[CORRELATION_HEADER].to_str().unwrap(),
        id.as_str()
    );
    let body: ErrorBody = response.json().await.unwrap();
    assert_eq!(body.error.kind, "validation");
    assert_eq!(body.error.correlation_id.as_deref(), Some(id.as_str()));
}

#[tokio::test]
async fn failing_stage_surfaces_as_server_error() {
    let research = serve_agent("research", vec![respond("ok")]).await;
    // Empty script: the model errors on its first turn.
    let analysis = serve_agent("analysis", Vec::new()).await;

    let coordinator = WorkflowCoordinator::new("research")
        .with_stage("research", client(research))
        .with_stage("analysis", client(analysis));
    let (addr, _handle) = spawn(
        coordinator_router(Arc::new(coordinator)),
        "127.0.0.1:0".parse().unwrap(),
    )
    .await
    .unwrap();

    let response = reqwest::Client::new()
        .post(format!("http://{addr}/workflow"))
        .json(&json!({ "query": "anything" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 500);
    let body: ErrorBody = response.json().await.unwrap();
    assert_eq!(body.error.kind, "stage_failure");
    assert!(body.error.message.contains("analysis"));
    assert!(body.error.message.contains("1 completed stage"));
}

/// Agent that answers every request with 503 and counts the hits.
async fn serve_overloaded(hits: Arc<AtomicU32>) -> String {
    let router = Router::new()
        .route(
            "/process",
            post(|State(hits): State<Arc<AtomicU32>>| async move {
                hits.fetch_add(1, Ordering::SeqCst);
                StatusCode::SERVICE_UNAVAILABLE
            }),
        )
        .with_state(hits);
    let (addr, _handle) = spawn(router, "127.0.0.1:0".parse().unwrap()).await.unwrap();
    format!("http://{addr}")
}

#[tokio::test]
async fn stage_that_exhausts_retries_stops_the_workflow() {
    let research = serve_agent("research", vec![respond("sources gathered")]).await;
    let analysis_hits = Arc::new(AtomicU32::new(0));
    let analysis = serve_overloaded(analysis_hits.clone()).await;
    let writer_hits = Arc::new(AtomicU32::new(0));
    let writer = serve_overloaded(writer_hits.clone()).await;

    let retry = RetryPolicy {
        max_retries: 2,
        min_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        factor: 2.0,
    };
    let stage = |base: String| Arc::new(RemoteAgentClient::new(base).with_retry_policy(retry.clone()));
    let coordinator = WorkflowCoordinator::new("research")
        .with_stage("research", stage(research))
        .with_stage("analysis", stage(analysis))
        .with_stage("writer", stage(writer));

    let err = coordinator
        .execute(WorkflowInput::new("survey async runtimes"))
        .await
        .unwrap_err();

    match err {
        PipelineError::StageFailure {
            stage,
            completed,
            source,
            ..
        } => {
            assert_eq!(stage, "analysis");
            assert_eq!(completed.len(), 1);
            assert_eq!(completed[0].stage, "research");
            assert_eq!(completed[0].result, "sources gathered");
            match *source {
                PipelineError::RemoteCall(remote) => {
                    assert_eq!(remote.kind, RemoteErrorKind::ServerBusy);
                    assert_eq!(remote.attempts, 3);
                }
                other => panic!("unexpected stage error: {other}"),
            }
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(analysis_hits.load(Ordering::SeqCst), 3);
    assert_eq!(writer_hits.load(Ordering::SeqCst), 0);
}
