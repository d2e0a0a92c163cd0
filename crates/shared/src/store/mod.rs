//! Durable store contract
//!
//! The durable store is the system of record for messages. It exposes an
//! append operation and an ordered stream of append events since a cursor.
//! Appending a message whose id already exists replaces its text and emits
//! it again under a new cursor, which is how streaming assistant replies are
//! persisted.

pub mod memory;
pub mod postgres;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::StoreError;
use crate::types::{ConversationId, Message};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Position in the store's append log. Strictly increasing per append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(pub u64);

impl Cursor {
    /// Cursor before the first event; subscribing from here yields the full snapshot
    pub const START: Cursor = Cursor(0);
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A message-added (or message-updated) event
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEvent {
    pub cursor: Cursor,
    pub message: Message,
}

/// Acknowledgement returned by a successful append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendAck {
    pub cursor: Cursor,
    /// Timestamp the store recorded for the message
    pub created_at: OffsetDateTime,
}

pub type StoreStream = Pin<Box<dyn Stream<Item = Result<StoreEvent, StoreError>> + Send>>;

#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    /// Append a message (or replace the text of an existing id)
    async fn append(
        &self,
        conversation_id: &ConversationId,
        message: &Message,
    ) -> Result<AppendAck, StoreError>;

    /// Stream append events for one conversation with a cursor after `since`.
    ///
    /// The stream first replays the stored snapshot, then follows live appends.
    /// Dropping the stream cancels the subscription.
    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
        since: Cursor,
    ) -> Result<StoreStream, StoreError>;

    /// Stream append events for every conversation with a cursor after `since`
    async fn subscribe_all(&self, since: Cursor) -> Result<StoreStream, StoreError>;
}
