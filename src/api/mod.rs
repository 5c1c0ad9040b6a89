mod errors;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post, put};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::service::WorkflowService;

pub use errors::{AppError, ErrorResponse};

/// Shared application state accessible by all handlers.
pub struct AppState {
    pub service: Arc<WorkflowService>,
}

/// Build the HTTP router over a service.
pub fn router(service: Arc<WorkflowService>, max_body: usize) -> Router {
    let state = Arc::new(AppState { service });

    Router::new()
        .route(
            "/workflows",
            get(handlers::list_workflows).post(handlers::create_workflow),
        )
        .route(
            "/workflows/{id}",
            get(handlers::get_canvas_info).delete(handlers::delete_workflow),
        )
        .route("/workflows/{id}/draft", put(handlers::save_workflow))
        .route("/workflows/{id}/copy", post(handlers::copy_workflow))
        .route("/workflows/{id}/publish", post(handlers::publish_workflow))
        .route("/workflows/{id}/test_run", post(handlers::test_run))
        .route("/workflows/{id}/run", post(handlers::openapi_run))
        .route("/workflows/{id}/stream_run", post(handlers::stream_run))
        .route(
            "/workflows/{id}/nodes/{node_id}/debug",
            post(handlers::node_debug_run),
        )
        .route(
            "/workflows/{id}/nodes/{node_id}/history",
            get(handlers::node_history),
        )
        .route("/executions/{id}", get(handlers::get_process))
        .route("/executions/{id}/resume", post(handlers::resume))
        .route("/executions/{id}/stream_resume", post(handlers::stream_resume))
        .route("/executions/{id}/cancel", post(handlers::cancel))
        .route("/executions/{id}/schema", get(handlers::history_schema))
        .route("/validate", post(handlers::validate_canvas))
        .route("/nodes", get(handlers::list_nodes))
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the REST API server.
pub async fn serve(host: &str, port: u16, service: Arc<WorkflowService>, max_body: usize) -> Result<()> {
    let app = router(service, max_body);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("canvasflow API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
