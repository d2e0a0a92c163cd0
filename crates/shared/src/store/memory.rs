//! In-process durable store backed by a broadcast channel
//!
//! Used for development (no `DATABASE_URL`) and as the store in tests. The
//! store keeps the latest version of every message; re-appending an id moves
//! it to a new cursor.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use super::{AppendAck, Cursor, DurableStore, StoreEvent, StoreStream};
use crate::error::StoreError;
use crate::types::{ConversationId, Message};

/// Live event buffer per subscriber before it is reported as lagged
const BROADCAST_CAPACITY: usize = 1024;

#[derive(Default)]
struct Log {
    events: Vec<StoreEvent>,
    last_cursor: u64,
}

pub struct MemoryStore {
    log: RwLock<Log>,
    live: broadcast::Sender<StoreEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (live, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            log: RwLock::new(Log::default()),
            live,
        }
    }

    /// Current messages of a conversation in cursor order
    pub async fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        let log = self.log.read().await;
        log.events
            .iter()
            .filter(|e| &e.message.conversation_id == conversation_id)
            .map(|e| e.message.clone())
            .collect()
    }

    async fn stream_from(&self, filter: Option<ConversationId>, since: Cursor) -> StoreStream {
        // Subscribe while holding the read lock so no append slips between
        // the snapshot and the live feed.
        let log = self.log.read().await;
        let live = self.live.subscribe();
        let high_water = Cursor(log.last_cursor);
        let backlog: Vec<StoreEvent> = log
            .events
            .iter()
            .filter(|e| e.cursor > since && matches_filter(filter.as_ref(), e))
            .cloned()
            .collect();
        drop(log);

        tracing::debug!(
            conversation_id = ?filter,
            since = %since,
            backlog = backlog.len(),
            "Memory store subscription opened"
        );

        let live = BroadcastStream::new(live).filter_map(move |item| {
            let out = match item {
                Ok(event)
                    if event.cursor > high_water
                        && event.cursor > since
                        && matches_filter(filter.as_ref(), &event) =>
                {
                    Some(Ok(event))
                }
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    Some(Err(StoreError::Lagged(skipped)))
                }
            };
            futures::future::ready(out)
        });

        Box::pin(stream::iter(backlog.into_iter().map(Ok)).chain(live))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn matches_filter(filter: Option<&ConversationId>, event: &StoreEvent) -> bool {
    filter.map_or(true, |id| &event.message.conversation_id == id)
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn append(
        &self,
        conversation_id: &ConversationId,
        message: &Message,
    ) -> Result<AppendAck, StoreError> {
        if &message.conversation_id != conversation_id {
            return Err(StoreError::Rejected(format!(
                "message {} belongs to {}, not {}",
                message.id, message.conversation_id, conversation_id
            )));
        }

        let mut log = self.log.write().await;
        log.last_cursor += 1;
        let cursor = Cursor(log.last_cursor);

        let mut stored = message.clone();
        if let Some(pos) = log.events.iter().position(|e| e.message.id == message.id) {
            // Streaming update: keep the original creation time
            let previous = log.events.remove(pos);
            stored.created_at = previous.message.created_at;
        }

        let event = StoreEvent {
            cursor,
            message: stored,
        };
        let created_at = event.message.created_at;
        log.events.push(event.clone());
        // No receivers is fine
        let _ = self.live.send(event);

        tracing::debug!(
            conversation_id = %conversation_id,
            message_id = %message.id,
            cursor = %cursor,
            "Message appended"
        );

        Ok(AppendAck { cursor, created_at })
    }

    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
        since: Cursor,
    ) -> Result<StoreStream, StoreError> {
        Ok(self.stream_from(Some(conversation_id.clone()), since).await)
    }

    async fn subscribe_all(&self, since: Cursor) -> Result<StoreStream, StoreError> {
        Ok(self.stream_from(None, since).await)
    }
}
