use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("rate limited")]
    RateLimited,
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("internal server error")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string()),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, self.to_string()),
            ApiError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "rate limited".to_string()),
            ApiError::ServiceUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            ApiError::Internal(err) => {
                tracing::error!("API internal error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message, "message": message }))).into_response()
    }
}

impl From<plinth_core::CoreError> for ApiError {
    fn from(e: plinth_core::CoreError) -> Self {
        use plinth_core::CoreError;
        match e {
            CoreError::NotFound | CoreError::SessionNotActive => ApiError::NotFound,
            CoreError::InvalidCommand { .. } => ApiError::BadRequest(e.to_string()),
            CoreError::InvalidTransition { .. } | CoreError::AlreadyActive(_) => {
                ApiError::Conflict(e.to_string())
            }
            CoreError::ResourceExhausted
            | CoreError::LaunchFailed(_)
            | CoreError::WorkerNotReady => ApiError::ServiceUnavailable(e.to_string()),
            CoreError::Worker(msg) => ApiError::Internal(anyhow::anyhow!(msg)),
        }
    }
}
