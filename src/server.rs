//! HTTP surface for agent runtimes and workflow coordinators.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;

use crate::agent::AgentRuntime;
use crate::error::{PipelineError, Result};
use crate::protocol::{AgentRequest, CorrelationId, ErrorBody, WorkflowInput};
use crate::remote::CORRELATION_HEADER;
use crate::workflow::{StageHealth, WorkflowCoordinator};

/// `POST /process`, `GET /health` and `GET /costs` for one runtime.
pub fn agent_router(runtime: Arc<AgentRuntime>) -> Router {
    Router::new()
        .route("/process", post(process))
        .route("/health", get(agent_health))
        .route("/costs", get(costs))
        .with_state(runtime)
}

/// `POST /workflow` and `GET /health` for a coordinator.
pub fn coordinator_router(coordinator: Arc<WorkflowCoordinator>) -> Router {
    Router::new()
        .route("/workflow", post(run_workflow))
        .route("/health", get(workflow_health))
        .with_state(coordinator)
}

pub async fn serve(router: Router, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, router).await?;
    Ok(())
}

/// Binds `addr` and serves in the background. Returns the bound address,
/// which matters when `addr` asks for port 0.
pub async fn spawn(router: Router, addr: SocketAddr) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            tracing::error!(error = %err, "server stopped");
        }
    });
    Ok((bound, handle))
}

/// Correlation id from the request header, if present and well formed.
fn header_correlation(headers: &HeaderMap) -> Option<CorrelationId> {
    headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|raw| CorrelationId::is_valid(raw))
        .map(|raw| CorrelationId::sanitize(Some(raw)))
}

fn status_for(err: &PipelineError) -> StatusCode {
    let cause = match err.root_cause() {
        PipelineError::StageFailure { source, .. } => source.as_ref(),
        other => other,
    };
    if cause.is_validation() {
        StatusCode::BAD_REQUEST
    } else if cause.is_timeout() {
        StatusCode::GATEWAY_TIMEOUT
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

fn with_correlation(mut response: Response, id: &CorrelationId) -> Response {
    if let Ok(value) = HeaderValue::from_str(id.as_str()) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

fn error_response(status: StatusCode, body: ErrorBody, id: &CorrelationId) -> Response {
    with_correlation((status, Json(body)).into_response(), id)
}

fn failure(err: &PipelineError, id: &CorrelationId) -> Response {
    error_response(
        status_for(err),
        ErrorBody::new(err.kind(), err.to_string(), Some(id)),
        id,
    )
}

fn rejected(rejection: JsonRejection, id: &CorrelationId) -> Response {
    error_response(
        StatusCode::BAD_REQUEST,
        ErrorBody::new("validation", rejection.body_text(), Some(id)),
        id,
    )
}

async fn process(
    State(runtime): State<Arc<AgentRuntime>>,
    headers: HeaderMap,
    payload: std::result::Result<Json<AgentRequest>, JsonRejection>,
) -> Response {
    let header_id = header_correlation(&headers);
    let mut request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return rejected(rejection, &header_id.unwrap_or_default()),
    };
    // A valid header id takes precedence over the one in the body.
    if let Some(id) = header_id {
        request.correlation_id = id;
    }
    request.normalize();
    let id = request.correlation_id.clone();

    match runtime.process(request).await {
        Ok(response) => with_correlation(Json(response).into_response(), &id),
        Err(err) => failure(&err, &id),
    }
}

async fn agent_health(State(runtime): State<Arc<AgentRuntime>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "agent": runtime.name(),
        "model": runtime.model_id(),
    }))
}

async fn costs(State(runtime): State<Arc<AgentRuntime>>) -> impl IntoResponse {
    Json(runtime.cost_summary())
}

async fn run_workflow(
    State(coordinator): State<Arc<WorkflowCoordinator>>,
    headers: HeaderMap,
    payload: std::result::Result<Json<WorkflowInput>, JsonRejection>,
) -> Response {
    let header_id = header_correlation(&headers);
    let mut input = match payload {
        Ok(Json(input)) => input,
        Err(rejection) => return rejected(rejection, &header_id.unwrap_or_default()),
    };
    if let Some(id) = header_id {
        input.correlation_id = Some(id.to_string());
    }
    // Fix the id here so error bodies carry the same one the stages saw.
    let id = CorrelationId::sanitize(input.correlation_id.as_deref());
    input.correlation_id = Some(id.to_string());

    match coordinator.execute(input).await {
        Ok(result) => with_correlation(Json(result).into_response(), &id),
        Err(err) => failure(&err, &id),
    }
}

#[derive(Serialize)]
struct WorkflowHealth {
    status: &'static str,
    workflow: String,
    stages: Vec<StageHealth>,
}

async fn workflow_health(State(coordinator): State<Arc<WorkflowCoordinator>>) -> Response {
    let stages = coordinator.health().await;
    let healthy = stages.iter().all(|s| s.healthy);
    let body = WorkflowHealth {
        status: if healthy { "ok" } else { "degraded" },
        workflow: coordinator.name().to_string(),
        stages,
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}
