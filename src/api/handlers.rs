use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::Stream;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tracing::warn;

use crate::canvas::{Issue, parse_unchecked, validate_tree};
use crate::engine::types::ExecutionStatus;
use crate::error::FlowError;
use crate::service::*;
use crate::storage::{PublishedVersion, WorkflowMeta};
use crate::stream::StreamEvent;

use super::AppState;
use super::errors::AppError;

pub const SPACE_HEADER: &str = "x-space-id";
pub const USER_HEADER: &str = "x-user-id";

/// Caller identity from `x-space-id` / `x-user-id`. Authentication happens
/// in front of this service.
pub struct CallerHeaders(pub Caller);

impl<S: Send + Sync> FromRequestParts<S> for CallerHeaders {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let space_id = header(SPACE_HEADER)
            .ok_or_else(|| AppError::BadRequest(format!("missing '{}' header", SPACE_HEADER)))?;
        let user_id = header(USER_HEADER).unwrap_or_default();
        Ok(CallerHeaders(Caller { space_id, user_id }))
    }
}

// --- Request/Response types ---

#[derive(Deserialize, Default)]
pub struct RunInput {
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Deserialize)]
pub struct ResumeRequest {
    pub event_id: String,
    /// Answer payload; a string or any JSON value.
    #[serde(default)]
    pub data: Value,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub execute_id: Option<String>,
    pub scene: HistoryScene,
}

#[derive(Deserialize)]
pub struct SchemaQuery {
    #[serde(default)]
    pub sub_execute_id: Option<String>,
}

#[derive(Serialize)]
pub struct ExecuteResponse {
    pub execute_id: String,
}

#[derive(Serialize)]
pub struct ValidateResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<Issue>,
}

#[derive(Serialize)]
pub struct NodeInfo {
    pub node_type: String,
    pub description: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

// --- Workflows ---

/// GET /workflows
pub async fn list_workflows(
    State(state): State<Arc<AppState>>,
    CallerHeaders(caller): CallerHeaders,
) -> Result<Json<Value>, AppError> {
    let workflows = state.service.list_workflows(&caller).await?;
    let total = workflows.len();
    Ok(Json(json!({ "workflows": workflows, "total": total })))
}

/// POST /workflows
pub async fn create_workflow(
    State(state): State<Arc<AppState>>,
    CallerHeaders(caller): CallerHeaders,
    Json(req): Json<CreateWorkflow>,
) -> Result<Json<WorkflowMeta>, AppError> {
    Ok(Json(state.service.create_workflow(&caller, req).await?))
}

/// GET /workflows/{id}
pub async fn get_canvas_info(
    State(state): State<Arc<AppState>>,
    CallerHeaders(caller): CallerHeaders,
    Path(id): Path<String>,
) -> Result<Json<CanvasInfo>, AppError> {
    Ok(Json(state.service.get_canvas_info(&caller, &id).await?))
}

/// PUT /workflows/{id}/draft
pub async fn save_workflow(
    State(state): State<Arc<AppState>>,
    CallerHeaders(caller): CallerHeaders,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let commit_id = state.service.save_workflow(&caller, &id, &body).await?;
    Ok(Json(json!({ "commit_id": commit_id })))
}

/// DELETE /workflows/{id}
pub async fn delete_workflow(
    State(state): State<Arc<AppState>>,
    CallerHeaders(caller): CallerHeaders,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    state.service.delete_workflow(&caller, &id).await?;
    Ok(Json(json!({ "deleted": id })))
}

/// POST /workflows/{id}/copy
pub async fn copy_workflow(
    State(state): State<Arc<AppState>>,
    CallerHeaders(caller): CallerHeaders,
    Path(id): Path<String>,
) -> Result<Json<WorkflowMeta>, AppError> {
    Ok(Json(state.service.copy_workflow(&caller, &id).await?))
}

/// POST /workflows/{id}/publish
pub async fn publish_workflow(
    State(state): State<Arc<AppState>>,
    CallerHeaders(caller): CallerHeaders,
    Path(id): Path<String>,
    Json(req): Json<PublishRequest>,
) -> Result<Json<PublishedVersion>, AppError> {
    Ok(Json(state.service.publish_workflow(&caller, &id, req).await?))
}

/// POST /validate
pub async fn validate_canvas(body: Bytes) -> Result<Json<ValidateResponse>, AppError> {
    let issues = match parse_unchecked(&body) {
        Ok(canvas) => validate_tree(&canvas),
        Err(FlowError::Validation(issues)) => issues,
        Err(e) => return Err(e.into()),
    };
    Ok(Json(ValidateResponse {
        valid: issues.is_empty(),
        issues,
    }))
}

// --- Runs ---

/// POST /workflows/{id}/test_run
pub async fn test_run(
    State(state): State<Arc<AppState>>,
    CallerHeaders(caller): CallerHeaders,
    Path(id): Path<String>,
    Json(req): Json<RunInput>,
) -> Result<Json<ExecuteResponse>, AppError> {
    let execute_id = state.service.test_run(&caller, &id, req.input).await?;
    Ok(Json(ExecuteResponse { execute_id }))
}

/// POST /workflows/{id}/nodes/{node_id}/debug
pub async fn node_debug_run(
    State(state): State<Arc<AppState>>,
    CallerHeaders(caller): CallerHeaders,
    Path((id, node_id)): Path<(String, String)>,
    Json(req): Json<NodeDebugInput>,
) -> Result<Json<ExecuteResponse>, AppError> {
    let execute_id = state
        .service
        .node_debug_run(&caller, &id, &node_id, req)
        .await?;
    Ok(Json(ExecuteResponse { execute_id }))
}

/// GET /workflows/{id}/nodes/{node_id}/history
pub async fn node_history(
    State(state): State<Arc<AppState>>,
    CallerHeaders(caller): CallerHeaders,
    Path((id, node_id)): Path<(String, String)>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<Value>, AppError> {
    let results = state
        .service
        .get_node_execute_history(&caller, &id, q.execute_id.as_deref(), &node_id, q.scene)
        .await?;
    Ok(Json(json!({ "results": results })))
}

/// POST /workflows/{id}/run
pub async fn openapi_run(
    State(state): State<Arc<AppState>>,
    CallerHeaders(caller): CallerHeaders,
    Path(id): Path<String>,
    Json(req): Json<OpenApiRun>,
) -> Result<Json<OpenApiResult>, AppError> {
    Ok(Json(state.service.openapi_run(&caller, &id, req).await?))
}

/// POST /workflows/{id}/stream_run
pub async fn stream_run(
    State(state): State<Arc<AppState>>,
    CallerHeaders(caller): CallerHeaders,
    Path(id): Path<String>,
    Json(req): Json<RunInput>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let (_, rx) = state
        .service
        .stream_run(&caller, &id, req.input, req.version.as_deref())
        .await?;
    Ok(sse(rx))
}

// --- Executions ---

/// GET /executions/{id}
pub async fn get_process(
    State(state): State<Arc<AppState>>,
    CallerHeaders(caller): CallerHeaders,
    Path(id): Path<String>,
) -> Result<Json<ProcessInfo>, AppError> {
    Ok(Json(state.service.get_process(&caller, &id).await?))
}

/// POST /executions/{id}/resume
pub async fn resume(
    State(state): State<Arc<AppState>>,
    CallerHeaders(caller): CallerHeaders,
    Path(id): Path<String>,
    Json(req): Json<ResumeRequest>,
) -> Result<Json<ExecuteResponse>, AppError> {
    let execute_id = state
        .service
        .resume(&caller, &id, &req.event_id, req.data)
        .await?;
    Ok(Json(ExecuteResponse { execute_id }))
}

/// POST /executions/{id}/stream_resume
pub async fn stream_resume(
    State(state): State<Arc<AppState>>,
    CallerHeaders(caller): CallerHeaders,
    Path(id): Path<String>,
    Json(req): Json<ResumeRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let rx = state
        .service
        .stream_resume(&caller, &id, &req.event_id, req.data)
        .await?;
    Ok(sse(rx))
}

/// POST /executions/{id}/cancel
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    CallerHeaders(caller): CallerHeaders,
    Path(id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let status: ExecutionStatus = state.service.cancel(&caller, &id).await?;
    Ok(Json(json!({ "execute_id": id, "status": status })))
}

/// GET /executions/{id}/schema
pub async fn history_schema(
    State(state): State<Arc<AppState>>,
    CallerHeaders(caller): CallerHeaders,
    Path(id): Path<String>,
    Query(q): Query<SchemaQuery>,
) -> Result<Json<HistorySchema>, AppError> {
    Ok(Json(
        state
            .service
            .get_history_schema(&caller, &id, q.sub_execute_id.as_deref())
            .await?,
    ))
}

// --- Misc ---

/// GET /nodes
pub async fn list_nodes(State(state): State<Arc<AppState>>) -> Json<Value> {
    let nodes: Vec<NodeInfo> = state
        .service
        .engine()
        .registry()
        .list()
        .iter()
        .map(|(kind, desc)| NodeInfo {
            node_type: kind.to_string(),
            description: desc.to_string(),
        })
        .collect();

    let total = nodes.len();
    Json(json!({
        "nodes": nodes,
        "total": total,
    }))
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// --- Helpers ---

fn sse_event(event: &StreamEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to encode stream event");
        "{}".to_string()
    });
    Event::default()
        .event(event.name())
        .id(event.index().to_string())
        .data(data)
}

/// Render stream events as SSE until the terminal event.
fn sse(rx: mpsc::Receiver<StreamEvent>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (event, rx))
    })
    .map(|event| Ok(sse_event(&event)));
    Sse::new(events).keep_alive(KeepAlive::default())
}
