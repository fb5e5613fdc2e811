//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use forkcast_shared::RealtimeError;
use serde_json::json;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Authentication required")]
    Unauthorized,
    #[error("Insufficient permissions")]
    Forbidden,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound,

    // Realtime transport errors
    #[error("Transport error: {0}")]
    Transport(String),

    // Internal errors
    #[error("Internal server error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Authentication
            ApiError::InvalidToken => (StatusCode::UNAUTHORIZED, "INVALID_TOKEN", self.to_string()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", self.to_string()),

            // Validation
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),

            // Resources
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),

            // Transport
            ApiError::Transport(_) => (StatusCode::SERVICE_UNAVAILABLE, "TRANSPORT_ERROR", "Stream unavailable".to_string()),

            // Internal
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<RealtimeError> for ApiError {
    fn from(err: RealtimeError) -> Self {
        match err {
            RealtimeError::Authentication(_) => ApiError::InvalidToken,
            RealtimeError::Validation(msg) => ApiError::Validation(msg),
            RealtimeError::Forbidden(_) => ApiError::Forbidden,
            RealtimeError::NotFound(_) => ApiError::NotFound,
            RealtimeError::Transport(msg) => ApiError::Transport(msg),
            RealtimeError::CapacityExceeded { .. } | RealtimeError::ReconnectionExhausted { .. } => {
                tracing::error!(error = %err, "Unexpected realtime error in HTTP handler");
                ApiError::Internal
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
