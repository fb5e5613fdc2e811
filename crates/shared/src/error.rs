//! Error types for Forkcast

use thiserror::Error;

use crate::types::UserId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RealtimeError {
    /// Missing or invalid credential; the connection is rejected
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// A client message lacks a required field or carries a bad value
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Room over its soft member limit (logged, never fatal)
    #[error("Room {room} over capacity ({members}/{limit})")]
    CapacityExceeded {
        room: String,
        members: usize,
        limit: usize,
    },

    /// Write to a primary or fallback channel failed; treated as a disconnect
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Reconnection attempts exhausted for {user_id} after {attempts} attempts")]
    ReconnectionExhausted { user_id: UserId, attempts: u32 },

    #[error("Not found: {0}")]
    NotFound(String),
}

impl RealtimeError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            RealtimeError::Authentication(_) => "AUTHENTICATION_FAILED",
            RealtimeError::Validation(_) => "VALIDATION_ERROR",
            RealtimeError::Forbidden(_) => "FORBIDDEN",
            RealtimeError::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            RealtimeError::Transport(_) => "TRANSPORT_ERROR",
            RealtimeError::ReconnectionExhausted { .. } => "RECONNECTION_EXHAUSTED",
            RealtimeError::NotFound(_) => "NOT_FOUND",
        }
    }

    /// Message sent back to the originating client
    pub fn client_message(&self) -> String {
        match self {
            RealtimeError::Authentication(_) => "Authentication failed".to_string(),
            RealtimeError::Validation(msg)
            | RealtimeError::Forbidden(msg)
            | RealtimeError::NotFound(msg) => msg.clone(),
            other => other.to_string(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        RealtimeError::Validation(msg.into())
    }
}

pub type RealtimeResult<T> = Result<T, RealtimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authentication_message_does_not_leak_reason() {
        let err = RealtimeError::Authentication("signature mismatch".to_string());
        assert_eq!(err.client_message(), "Authentication failed");
        assert_eq!(err.code(), "AUTHENTICATION_FAILED");
    }

    #[test]
    fn test_validation_message_is_passed_through() {
        let err = RealtimeError::validation("orderId is required");
        assert_eq!(err.client_message(), "orderId is required");
    }
}
