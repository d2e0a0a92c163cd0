//! Client error types

use std::time::Duration;

use relaydesk_shared::{Message, RelayError, StoreError};

use crate::connection::SocketState;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport closed by far end")]
    TransportClosed,

    #[error("Handshake not acknowledged within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Connection is not open (state: {0:?})")]
    NotConnected(SocketState),

    #[error("Connection handle closed")]
    Closed,

    #[error(transparent)]
    Relay(#[from] RelayError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ClientError {
    /// Returns true if a fresh connection attempt may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::TransportClosed => true,
            ClientError::HandshakeTimeout(_) => true,
            ClientError::HandshakeRejected(_) => true,

            ClientError::NotConnected(_) => false,
            ClientError::Closed => false,
            ClientError::Relay(_) => false,
            ClientError::Store(_) => false,
        }
    }
}

/// A send that could not be written to the durable store.
///
/// The optimistic copy stays in the session view marked as failed; the
/// message is handed back so the drafted text is never lost.
#[derive(Debug, thiserror::Error)]
#[error("Message {} could not be stored: {source}", .message.id)]
pub struct SendError {
    pub message: Message,
    #[source]
    pub source: StoreError,
}
