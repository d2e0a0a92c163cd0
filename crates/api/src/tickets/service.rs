//! Ticket service
//!
//! Validated operator updates plus their side effects: closing appends one
//! `system` message to the durable store, and every change is pushed to the
//! conversation's room as a `ticket_updated` envelope.
//!
//! A close is only persisted once its closure message is stored, and the
//! message's cursor is kept on the ticket. Reopening compares store cursors,
//! never sender clocks.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use relaydesk_shared::{
    AppendAck, Cursor, DurableStore, Envelope, Message, MessageId, ParticipantId, Role, Ticket,
    TicketId, TicketNote, TicketStatus, TicketUpdate,
};

use super::machine::{self, TicketPatch, Transition};
use super::{TicketError, TicketStore};
use crate::websocket::WebSocketState;

/// Text of the synthetic message appended when a ticket is closed
pub const CLOSED_NOTICE: &str = "This conversation has been closed by an operator.";

/// Longest note accepted
const MAX_NOTE_LEN: usize = 4000;

/// What the projector did with one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Created,
    Touched,
    Reopened,
}

pub struct TicketService {
    tickets: Arc<dyn TicketStore>,
    store: Arc<dyn DurableStore>,
    ws_state: WebSocketState,
    append_retries: usize,
    /// Serialises read-validate-write cycles on this node
    write_lock: Mutex<()>,
}

impl TicketService {
    pub fn new(
        tickets: Arc<dyn TicketStore>,
        store: Arc<dyn DurableStore>,
        ws_state: WebSocketState,
        append_retries: usize,
    ) -> Self {
        Self {
            tickets,
            store,
            ws_state,
            append_retries,
            write_lock: Mutex::new(()),
        }
    }

    pub fn tickets(&self) -> &Arc<dyn TicketStore> {
        &self.tickets
    }

    pub async fn list(&self, status: Option<TicketStatus>) -> Result<Vec<Ticket>, TicketError> {
        self.tickets.list(status).await
    }

    pub async fn get(&self, id: TicketId) -> Result<Ticket, TicketError> {
        self.tickets.get(id).await?.ok_or(TicketError::NotFound(id))
    }

    /// Apply an operator request. A request whose target already holds
    /// returns the ticket unchanged.
    pub async fn update(
        &self,
        id: TicketId,
        patch: TicketPatch,
        actor_id: Option<ParticipantId>,
    ) -> Result<Ticket, TicketError> {
        let _guard = self.write_lock.lock().await;
        let ticket = self.get(id).await?;

        let mut change = match machine::apply(&ticket, &patch)? {
            Transition::NoOp => {
                tracing::debug!(ticket_id = %id, "Ticket update is a no-op");
                return Ok(ticket);
            }
            Transition::Changed(change) => change,
        };

        // Nothing is persisted until the closure message is in the store
        let closure = if change.completes() {
            let message = closure_message(&ticket);
            let ack = self.append_closure(&ticket, &message).await?;
            change.closed_at_cursor = Some(ack.cursor);
            Some(message)
        } else {
            None
        };

        let updated = self.tickets.update(id, &change).await?;
        tracing::info!(
            ticket_id = %id,
            actor_id = ?actor_id,
            from = %ticket.status,
            to = %updated.status,
            assigned_operator_id = ?updated.assigned_operator_id,
            "Ticket updated"
        );

        if let Some(message) = closure {
            // Live participants see it now; the store delivers it to everyone else
            self.ws_state
                .rooms
                .broadcast(&updated.conversation_id, Envelope::Message(message))
                .await;
        }
        self.broadcast(&updated).await;
        Ok(updated)
    }

    pub async fn add_note(
        &self,
        id: TicketId,
        text: String,
        author: ParticipantId,
    ) -> Result<Ticket, TicketError> {
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(TicketError::Validation("note text must not be empty".to_string()));
        }
        if text.len() > MAX_NOTE_LEN {
            return Err(TicketError::Validation(format!(
                "note text exceeds {} characters",
                MAX_NOTE_LEN
            )));
        }

        let ticket = self
            .tickets
            .add_note(
                id,
                TicketNote {
                    text,
                    author,
                    at: OffsetDateTime::now_utc(),
                },
            )
            .await?;
        tracing::debug!(ticket_id = %id, author = %author, "Ticket note added");
        Ok(ticket)
    }

    /// Fold one durable-store message, stored at `cursor`, into the ticket board
    pub async fn record_activity(
        &self,
        message: &Message,
        cursor: Cursor,
    ) -> Result<Activity, TicketError> {
        let _guard = self.write_lock.lock().await;

        let Some(ticket) = self
            .tickets
            .find_by_conversation(&message.conversation_id)
            .await?
        else {
            let ticket = Ticket::open_for(message.conversation_id.clone(), message.created_at)?;
            let ticket = self.tickets.insert(ticket).await?;
            tracing::info!(
                ticket_id = %ticket.ticket_id,
                conversation_id = %ticket.conversation_id,
                "Ticket opened"
            );
            self.broadcast(&ticket).await;
            return Ok(Activity::Created);
        };

        self.tickets.touch(ticket.ticket_id, message.created_at).await?;

        // Replayed history from before the close must not reopen it
        let after_close = ticket
            .closed_at_cursor
            .map_or(true, |closed| cursor > closed);
        if message.sender_role != Role::User || !after_close {
            return Ok(Activity::Touched);
        }

        match machine::reactivate(&ticket) {
            Transition::NoOp => Ok(Activity::Touched),
            Transition::Changed(change) => {
                let reopened = self.tickets.update(ticket.ticket_id, &change).await?;
                tracing::info!(
                    ticket_id = %reopened.ticket_id,
                    conversation_id = %reopened.conversation_id,
                    "Ticket reopened by user activity"
                );
                self.broadcast(&reopened).await;
                Ok(Activity::Reopened)
            }
        }
    }

    async fn append_closure(
        &self,
        ticket: &Ticket,
        message: &Message,
    ) -> Result<AppendAck, TicketError> {
        let strategy = ExponentialBackoff::from_millis(10)
            .max_delay(Duration::from_millis(200))
            .map(jitter)
            .take(self.append_retries);

        let store = Arc::clone(&self.store);
        let ack = Retry::spawn(strategy, || {
            let store = Arc::clone(&store);
            let message = message.clone();
            async move { store.append(&message.conversation_id, &message).await }
        })
        .await
        .map_err(|e| {
            tracing::error!(
                ticket_id = %ticket.ticket_id,
                error = %e,
                "Failed to append closure message, ticket left open"
            );
            e
        })?;

        tracing::debug!(
            ticket_id = %ticket.ticket_id,
            message_id = %message.id,
            cursor = %ack.cursor,
            "Closure message appended"
        );
        Ok(ack)
    }

    async fn broadcast(&self, ticket: &Ticket) {
        self.ws_state
            .rooms
            .broadcast(
                &ticket.conversation_id,
                Envelope::TicketUpdated(TicketUpdate {
                    ticket_id: ticket.ticket_id,
                    conversation_id: ticket.conversation_id.clone(),
                    status: ticket.status,
                    assigned_operator_id: ticket.assigned_operator_id,
                    priority: ticket.priority,
                }),
            )
            .await;
    }
}

/// The closure notice for the ticket as it stands before the close. Every
/// attempt at the same close yields the same message id, so a retry after a
/// failed status write replaces the stored notice instead of adding another.
fn closure_message(ticket: &Ticket) -> Message {
    let mut message = Message::system(ticket.conversation_id.clone(), ticket.channel, CLOSED_NOTICE);
    let key = format!("closure:{}", ticket.updated_at.unix_timestamp_nanos());
    message.id = MessageId(Uuid::new_v5(&ticket.ticket_id.0, key.as_bytes()));
    message
}
