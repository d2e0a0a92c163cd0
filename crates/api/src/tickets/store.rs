//! Ticket persistence
//!
//! Field updates are last-write-wins per field: a change only touches the
//! fields it names.

use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use relaydesk_shared::{ConversationId, Cursor, Ticket, TicketId, TicketNote, TicketStatus};

use super::{TicketChange, TicketError};

#[async_trait]
pub trait TicketStore: Send + Sync + 'static {
    async fn get(&self, id: TicketId) -> Result<Option<Ticket>, TicketError>;

    async fn find_by_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Ticket>, TicketError>;

    /// Tickets ordered by most recent activity first
    async fn list(&self, status: Option<TicketStatus>) -> Result<Vec<Ticket>, TicketError>;

    /// Insert a ticket unless its conversation already has one; returns the
    /// ticket that ends up stored.
    async fn insert(&self, ticket: Ticket) -> Result<Ticket, TicketError>;

    async fn update(&self, id: TicketId, change: &TicketChange) -> Result<Ticket, TicketError>;

    /// Move `last_activity_at` forward (never backwards)
    async fn touch(&self, id: TicketId, at: OffsetDateTime) -> Result<(), TicketError>;

    async fn add_note(&self, id: TicketId, note: TicketNote) -> Result<Ticket, TicketError>;

    /// Last store cursor a named projector has fully processed
    async fn load_cursor(&self, name: &str) -> Result<Cursor, TicketError>;

    async fn save_cursor(&self, name: &str, cursor: Cursor) -> Result<(), TicketError>;
}

/// Apply a change to an in-memory ticket
pub(crate) fn apply_change(ticket: &mut Ticket, change: &TicketChange, now: OffsetDateTime) {
    if let Some(status) = change.status {
        ticket.status = status;
        if status == TicketStatus::Completed {
            ticket.completed_at = Some(now);
            ticket.closed_at_cursor = change.closed_at_cursor;
        } else {
            ticket.closed_at_cursor = None;
        }
    }
    if let Some(assignee) = change.assigned_operator_id {
        ticket.assigned_operator_id = assignee;
    }
    if let Some(priority) = change.priority {
        ticket.priority = priority;
    }
    ticket.updated_at = now;
}

#[derive(Default)]
struct Board {
    tickets: HashMap<TicketId, Ticket>,
    by_conversation: HashMap<ConversationId, TicketId>,
    cursors: HashMap<String, Cursor>,
}

/// Ticket board kept in process memory
#[derive(Default)]
pub struct MemoryTicketStore {
    board: RwLock<Board>,
}

impl MemoryTicketStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TicketStore for MemoryTicketStore {
    async fn get(&self, id: TicketId) -> Result<Option<Ticket>, TicketError> {
        Ok(self.board.read().await.tickets.get(&id).cloned())
    }

    async fn find_by_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Ticket>, TicketError> {
        let board = self.board.read().await;
        Ok(board
            .by_conversation
            .get(conversation_id)
            .and_then(|id| board.tickets.get(id))
            .cloned())
    }

    async fn list(&self, status: Option<TicketStatus>) -> Result<Vec<Ticket>, TicketError> {
        let board = self.board.read().await;
        let mut tickets: Vec<_> = board
            .tickets
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        tickets.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(tickets)
    }

    async fn insert(&self, ticket: Ticket) -> Result<Ticket, TicketError> {
        let mut board = self.board.write().await;
        if let Some(existing) = board
            .by_conversation
            .get(&ticket.conversation_id)
            .and_then(|id| board.tickets.get(id))
        {
            return Ok(existing.clone());
        }
        board
            .by_conversation
            .insert(ticket.conversation_id.clone(), ticket.ticket_id);
        board.tickets.insert(ticket.ticket_id, ticket.clone());
        Ok(ticket)
    }

    async fn update(&self, id: TicketId, change: &TicketChange) -> Result<Ticket, TicketError> {
        let mut board = self.board.write().await;
        let ticket = board.tickets.get_mut(&id).ok_or(TicketError::NotFound(id))?;
        apply_change(ticket, change, OffsetDateTime::now_utc());
        Ok(ticket.clone())
    }

    async fn touch(&self, id: TicketId, at: OffsetDateTime) -> Result<(), TicketError> {
        let mut board = self.board.write().await;
        let ticket = board.tickets.get_mut(&id).ok_or(TicketError::NotFound(id))?;
        ticket.last_activity_at = ticket.last_activity_at.max(at);
        Ok(())
    }

    async fn add_note(&self, id: TicketId, note: TicketNote) -> Result<Ticket, TicketError> {
        let mut board = self.board.write().await;
        let ticket = board.tickets.get_mut(&id).ok_or(TicketError::NotFound(id))?;
        ticket.notes.push(note);
        ticket.updated_at = OffsetDateTime::now_utc();
        Ok(ticket.clone())
    }

    async fn load_cursor(&self, name: &str) -> Result<Cursor, TicketError> {
        Ok(self
            .board
            .read()
            .await
            .cursors
            .get(name)
            .copied()
            .unwrap_or(Cursor::START))
    }

    async fn save_cursor(&self, name: &str, cursor: Cursor) -> Result<(), TicketError> {
        self.board
            .write()
            .await
            .cursors
            .insert(name.to_string(), cursor);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use relaydesk_shared::{Channel, ParticipantId, TicketPriority};

    fn new_ticket() -> Ticket {
        let conv = ConversationId::for_subject(ParticipantId::new(), Channel::Operator);
        Ticket::open_for(conv, OffsetDateTime::now_utc()).unwrap()
    }

    #[tokio::test]
    async fn test_insert_is_one_per_conversation() {
        let store = MemoryTicketStore::new();
        let first = store.insert(new_ticket()).await.unwrap();

        let mut duplicate = new_ticket();
        duplicate.conversation_id = first.conversation_id.clone();
        let stored = store.insert(duplicate).await.unwrap();

        assert_eq!(stored.ticket_id, first.ticket_id);
        assert_eq!(store.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_touches_only_named_fields() {
        let store = MemoryTicketStore::new();
        let ticket = store.insert(new_ticket()).await.unwrap();
        let operator = ParticipantId::new();

        store
            .update(
                ticket.ticket_id,
                &TicketChange {
                    status: Some(TicketStatus::InProgress),
                    assigned_operator_id: Some(Some(operator)),
                    priority: None,
                    ..TicketChange::default()
                },
            )
            .await
            .unwrap();
        let updated = store
            .update(
                ticket.ticket_id,
                &TicketChange {
                    priority: Some(TicketPriority::High),
                    ..TicketChange::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.status, TicketStatus::InProgress);
        assert_eq!(updated.assigned_operator_id, Some(operator));
        assert_eq!(updated.priority, TicketPriority::High);
        assert!(updated.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_list_filters_and_orders_by_activity() {
        let store = MemoryTicketStore::new();
        let older = store.insert(new_ticket()).await.unwrap();
        let newer = store.insert(new_ticket()).await.unwrap();
        store
            .touch(newer.ticket_id, OffsetDateTime::now_utc() + time::Duration::minutes(5))
            .await
            .unwrap();

        let all = store.list(None).await.unwrap();
        assert_eq!(all[0].ticket_id, newer.ticket_id);
        assert_eq!(all[1].ticket_id, older.ticket_id);
        assert!(store
            .list(Some(TicketStatus::Completed))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_touch_never_moves_backwards() {
        let store = MemoryTicketStore::new();
        let ticket = store.insert(new_ticket()).await.unwrap();
        store
            .touch(ticket.ticket_id, ticket.last_activity_at - time::Duration::hours(1))
            .await
            .unwrap();
        let after = store.get(ticket.ticket_id).await.unwrap().unwrap();
        assert_eq!(after.last_activity_at, ticket.last_activity_at);
    }

    #[tokio::test]
    async fn test_missing_ticket_is_not_found() {
        let store = MemoryTicketStore::new();
        let id = TicketId::new();
        assert!(matches!(
            store.update(id, &TicketChange::default()).await,
            Err(TicketError::NotFound(_))
        ));
    }
}
