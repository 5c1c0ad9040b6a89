use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::error;

use crate::canvas::Issue;
use crate::error::{FlowError, codes};

#[derive(Serialize)]
pub struct ErrorResponse {
    pub code: i64,
    pub msg: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<Issue>,
}

/// Application error type that converts to HTTP responses.
pub enum AppError {
    BadRequest(String),
    Flow(FlowError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let err = match self {
            AppError::BadRequest(msg) => {
                let body = ErrorResponse {
                    code: codes::ERR_INVALID_PARAM,
                    msg,
                    issues: Vec::new(),
                };
                return (StatusCode::BAD_REQUEST, Json(body)).into_response();
            }
            AppError::Flow(err) => err,
        };

        let status = match &err {
            FlowError::Validation(_) | FlowError::InvalidParam(_) => StatusCode::BAD_REQUEST,
            FlowError::InterruptNotSupported => StatusCode::UNPROCESSABLE_ENTITY,
            FlowError::NotFound(_) => StatusCode::NOT_FOUND,
            FlowError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            FlowError::AlreadyResumed(_) | FlowError::Cancelled => StatusCode::CONFLICT,
            FlowError::NodeRuntime { .. } | FlowError::ExecutionFailed(_) | FlowError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if let FlowError::Store(e) = &err {
            error!(error = %format!("{:#}", e), "Request failed in storage");
        }

        let code = err.code();
        let msg = err.to_string();
        let issues = match err {
            FlowError::Validation(issues) => issues,
            _ => Vec::new(),
        };
        (status, Json(ErrorResponse { code, msg, issues })).into_response()
    }
}

impl From<FlowError> for AppError {
    fn from(err: FlowError) -> Self {
        AppError::Flow(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Flow(FlowError::Store(err))
    }
}
