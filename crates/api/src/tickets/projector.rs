//! Ticket projector
//!
//! Tails every conversation in the durable store and folds each message into
//! the ticket board. Progress is checkpointed so a restart resumes from the
//! last processed cursor. Storage failures are retried from the same cursor;
//! a message that can never be projected is logged and skipped.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use relaydesk_shared::{Cursor, DurableStore, StoreError, StoreEvent};

use super::{TicketError, TicketService};

/// Checkpoint name in the cursor table
pub const PROJECTOR_NAME: &str = "tickets";

const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(500);

pub struct TicketProjector {
    store: Arc<dyn DurableStore>,
    service: Arc<TicketService>,
}

impl TicketProjector {
    pub fn new(store: Arc<dyn DurableStore>, service: Arc<TicketService>) -> Self {
        Self { store, service }
    }

    /// Run until `cancel` fires
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut cursor = match self.service.tickets().load_cursor(PROJECTOR_NAME).await {
            Ok(cursor) => cursor,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load projector cursor, replaying from start");
                Cursor::START
            }
        };
        tracing::info!(cursor = %cursor, "Ticket projector started");

        loop {
            let mut stream = match self.store.subscribe_all(cursor).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, "Projector subscription failed");
                    if sleep_or_cancel(&cancel).await {
                        break;
                    }
                    continue;
                }
            };

            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!(cursor = %cursor, "Ticket projector stopped");
                        return;
                    }
                    item = stream.next() => item,
                };

                match item {
                    Some(Ok(event)) => match self.project(&event).await {
                        Ok(()) => cursor = cursor.max(event.cursor),
                        Err(e) if e.is_transient() => {
                            // Leave the cursor so the event is retried on resubscribe
                            tracing::warn!(
                                cursor = %event.cursor,
                                message_id = %event.message.id,
                                error = %e,
                                "Failed to project message, retrying"
                            );
                            break;
                        }
                        Err(e) => {
                            tracing::error!(
                                cursor = %event.cursor,
                                message_id = %event.message.id,
                                conversation_id = %event.message.conversation_id,
                                error = %e,
                                "Skipping message that cannot be projected"
                            );
                            if let Err(e) = self.checkpoint(event.cursor).await {
                                tracing::warn!(error = %e, "Failed to checkpoint past skipped message");
                                break;
                            }
                            cursor = cursor.max(event.cursor);
                        }
                    },
                    Some(Err(StoreError::Lagged(skipped))) => {
                        tracing::warn!(skipped = skipped, cursor = %cursor, "Projector lagged, resubscribing");
                        break;
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Projector stream error, resubscribing");
                        break;
                    }
                    None => {
                        tracing::debug!("Projector stream ended, resubscribing");
                        break;
                    }
                }
            }

            if sleep_or_cancel(&cancel).await {
                break;
            }
        }

        tracing::info!(cursor = %cursor, "Ticket projector stopped");
    }

    async fn project(&self, event: &StoreEvent) -> Result<(), TicketError> {
        let activity = self
            .service
            .record_activity(&event.message, event.cursor)
            .await?;
        tracing::debug!(
            cursor = %event.cursor,
            conversation_id = %event.message.conversation_id,
            activity = ?activity,
            "Projected message"
        );
        self.checkpoint(event.cursor).await
    }

    async fn checkpoint(&self, cursor: Cursor) -> Result<(), TicketError> {
        self.service.tickets().save_cursor(PROJECTOR_NAME, cursor).await
    }
}

/// Returns true when cancelled during the wait
async fn sleep_or_cancel(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => false,
    }
}
