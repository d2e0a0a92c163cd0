//! Operator ticket queue
//!
//! Tickets are derived from conversation activity: the projector creates one
//! per conversation on its first message and keeps `last_activity_at` current.
//! Operators move tickets through the state machine over the HTTP surface.
//!
//! - **machine**: pure status/assignment transitions
//! - **store**: ticket persistence (in-memory and Postgres)
//! - **service**: validated updates, closure messages, broadcasts
//! - **projector**: background task tailing the durable store

pub mod machine;
pub mod postgres;
pub mod projector;
pub mod service;
pub mod store;

use relaydesk_shared::{RelayError, StoreError, TicketId, TicketStatus};

pub use machine::{TicketChange, TicketPatch, Transition};
pub use postgres::PgTicketStore;
pub use projector::TicketProjector;
pub use service::TicketService;
pub use store::{MemoryTicketStore, TicketStore};

#[derive(Debug, thiserror::Error)]
pub enum TicketError {
    #[error("Ticket not found: {0}")]
    NotFound(TicketId),

    #[error("Invalid transition from {from}: {reason}")]
    InvalidTransition {
        from: TicketStatus,
        reason: &'static str,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

impl TicketError {
    /// Storage failures may succeed on retry; anything else is about the
    /// input and fails the same way every time
    pub fn is_transient(&self) -> bool {
        matches!(self, TicketError::Database(_) | TicketError::Store(_))
    }
}
