//! Scheduler error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use quay_store::StoreError;
use quay_types::ServerKey;
use serde::Serialize;
use thiserror::Error;

/// Control plane errors
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// No live link to the agent; the command can be retried later
    #[error("Agent {0} is not connected")]
    UnreachableAgent(ServerKey),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Autoscaling is off for the model (min and max replicas both zero)
    #[error("Scaling disabled for model {0}")]
    ScalingDisabled(String),

    #[error("Replica limit exceeded for {model}: {requested} outside [{min}, {max}]")]
    LimitExceeded {
        model: String,
        requested: u32,
        min: u32,
        max: u32,
    },

    /// The model changed too recently to be rescaled
    #[error("Model {model} is not stable: last changed {seconds_ago}s ago")]
    ModelNotStable { model: String, seconds_ago: i64 },

    #[error("Model {model} has no available version")]
    NoAvailableVersion { model: String },

    #[error("Model {model} version {requested} is not the last available version ({available})")]
    NotLastAvailable {
        model: String,
        requested: u32,
        available: u32,
    },
}

/// Result type for scheduler operations
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

/// Control surface errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            ApiError::Scheduler(e) => match e {
                SchedulerError::ModelNotFound(_)
                | SchedulerError::Store(StoreError::ModelNotFound(_))
                | SchedulerError::Store(StoreError::VersionNotFound { .. }) => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND")
                }
                SchedulerError::Store(StoreError::ServerNotFound(_)) => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND")
                }
                SchedulerError::Store(StoreError::StaleStateUpdate { .. })
                | SchedulerError::Store(StoreError::Conflict(_)) => {
                    (StatusCode::CONFLICT, "CONFLICT")
                }
                SchedulerError::Store(StoreError::InvalidTransition { .. })
                | SchedulerError::Store(StoreError::ServerMismatch { .. }) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "INVALID_TRANSITION")
                }
                SchedulerError::UnreachableAgent(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "UNREACHABLE_AGENT")
                }
                SchedulerError::ScalingDisabled(_) => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "SCALING_DISABLED")
                }
                SchedulerError::LimitExceeded { .. } => {
                    (StatusCode::UNPROCESSABLE_ENTITY, "LIMIT_EXCEEDED")
                }
                SchedulerError::ModelNotStable { .. } => (StatusCode::CONFLICT, "MODEL_NOT_STABLE"),
                SchedulerError::NoAvailableVersion { .. }
                | SchedulerError::NotLastAvailable { .. } => {
                    (StatusCode::CONFLICT, "VERSION_MISMATCH")
                }
            },
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Scheduler(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let body = ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_status_codes() {
        let cases = [
            (ApiError::NotFound("iris".into()), StatusCode::NOT_FOUND),
            (
                SchedulerError::ScalingDisabled("iris".into()).into(),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                SchedulerError::ModelNotStable {
                    model: "iris".into(),
                    seconds_ago: 1,
                }
                .into(),
                StatusCode::CONFLICT,
            ),
            (
                SchedulerError::Store(StoreError::ModelNotFound("iris".into())).into(),
                StatusCode::NOT_FOUND,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
