//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use relaydesk_shared::{RelayError, StoreError};

use crate::tickets::TicketError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound,
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid ticket transition: {0}")]
    InvalidTransition(String),

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Durable store error: {0}")]
    Store(String),
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable")]
    ServiceUnavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Validation
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            // Resources
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            ApiError::InvalidTransition(msg) => (StatusCode::CONFLICT, "INVALID_TRANSITION", msg.clone()),

            // Internal
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", "Database error".to_string()),
            ApiError::Store(_) => (StatusCode::BAD_GATEWAY, "STORE_ERROR", "Durable store error".to_string()),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
            ApiError::ServiceUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", self.to_string()),
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

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("Database error: {:?}", err);
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound,
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                // PostgreSQL unique violation
                Some("23505") => ApiError::Conflict("Resource already exists".to_string()),
                // Check violation (e.g. a waiting ticket with an assignee)
                Some("23514") => ApiError::Conflict("Update violates ticket invariants".to_string()),
                _ => ApiError::Database(db_err.to_string()),
            },
            _ => ApiError::Database(err.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Database(e) => e.into(),
            StoreError::Rejected(msg) => ApiError::BadRequest(msg),
            StoreError::Unavailable(_) => ApiError::ServiceUnavailable,
            other => {
                tracing::error!(error = %other, "Durable store error");
                ApiError::Store(other.to_string())
            }
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::NotFound(_) => ApiError::NotFound,
            RelayError::Validation(msg)
            | RelayError::InvalidConversation(msg)
            | RelayError::MalformedEnvelope(msg) => ApiError::Validation(msg),
            RelayError::Internal(msg) => {
                tracing::error!(error = %msg, "Internal error");
                ApiError::Internal
            }
        }
    }
}

impl From<TicketError> for ApiError {
    fn from(err: TicketError) -> Self {
        match err {
            TicketError::NotFound(_) => ApiError::NotFound,
            err @ TicketError::InvalidTransition { .. } => ApiError::InvalidTransition(err.to_string()),
            TicketError::Validation(msg) => ApiError::Validation(msg),
            TicketError::Database(e) => e.into(),
            TicketError::Store(e) => e.into(),
            TicketError::Relay(e) => e.into(),
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
