use thiserror::Error;

use crate::canvas::Issue;

/// Stable numeric error codes surfaced to API callers.
pub mod codes {
    pub const ERR_VALIDATION: i64 = 720_702_001;
    pub const ERR_INVALID_PARAM: i64 = 720_702_002;
    pub const ERR_NODE_RUNTIME: i64 = 720_702_003;
    pub const ERR_EXECUTION_FAILED: i64 = 720_702_004;
    pub const ERR_OPENAPI_INTERRUPT_NOT_SUPPORTED: i64 = 720_702_005;
    pub const ERR_NOT_FOUND: i64 = 720_702_006;
    pub const ERR_ALREADY_RESUMED: i64 = 720_702_007;
    pub const ERR_PERMISSION_DENIED: i64 = 720_702_008;
    pub const ERR_CANCELLED: i64 = 720_702_009;
    pub const ERR_INTERNAL: i64 = 720_700_000;
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("canvas validation failed: {}", summarize(.0))]
    Validation(Vec<Issue>),

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("node '{node_id}' failed: {message}")]
    NodeRuntime { node_id: String, message: String },

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("workflow contains nodes that may interrupt; synchronous run is not supported")]
    InterruptNotSupported,

    #[error("{0} not found")]
    NotFound(String),

    #[error("interrupt event '{0}' was already resumed")]
    AlreadyResumed(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("execution was cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type FlowResult<T> = Result<T, FlowError>;

fn summarize(issues: &[Issue]) -> String {
    match issues {
        [] => "no issues".to_string(),
        [one] => one.to_string(),
        [first, rest @ ..] => format!("{} (and {} more)", first, rest.len()),
    }
}

impl FlowError {
    pub fn code(&self) -> i64 {
        match self {
            FlowError::Validation(_) => codes::ERR_VALIDATION,
            FlowError::InvalidParam(_) => codes::ERR_INVALID_PARAM,
            FlowError::NodeRuntime { .. } => codes::ERR_NODE_RUNTIME,
            FlowError::ExecutionFailed(_) => codes::ERR_EXECUTION_FAILED,
            FlowError::InterruptNotSupported => codes::ERR_OPENAPI_INTERRUPT_NOT_SUPPORTED,
            FlowError::NotFound(_) => codes::ERR_NOT_FOUND,
            FlowError::AlreadyResumed(_) => codes::ERR_ALREADY_RESUMED,
            FlowError::PermissionDenied(_) => codes::ERR_PERMISSION_DENIED,
            FlowError::Cancelled => codes::ERR_CANCELLED,
            FlowError::Store(_) => codes::ERR_INTERNAL,
        }
    }

    pub fn not_found(what: &str, id: &str) -> Self {
        FlowError::NotFound(format!("{} '{}'", what, id))
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        FlowError::InvalidParam(err.to_string())
    }
}
