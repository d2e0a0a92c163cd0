//! Error types for RelayDesk

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Invalid conversation id: {0}")]
    InvalidConversation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by a durable store implementation
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Stored row is invalid: {0}")]
    Corrupt(String),

    #[error("Append rejected: {0}")]
    Rejected(String),

    #[error("Subscription lagged behind by {0} events")]
    Lagged(u64),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<RelayError> for StoreError {
    fn from(err: RelayError) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}
