//! Postgres ticket store

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use relaydesk_shared::{
    Channel, ConversationId, Cursor, ParticipantId, Ticket, TicketId, TicketNote, TicketPriority,
    TicketStatus,
};

use super::{TicketChange, TicketError, TicketStore};

const TICKET_COLUMNS: &str = "id, subject_id, channel, conversation_id, status, assigned_operator_id, \
     priority, last_activity_at, created_at, updated_at, completed_at, closed_at_cursor";

#[derive(Debug, FromRow)]
struct TicketRow {
    id: Uuid,
    subject_id: Uuid,
    channel: Channel,
    conversation_id: String,
    status: TicketStatus,
    assigned_operator_id: Option<Uuid>,
    priority: TicketPriority,
    last_activity_at: OffsetDateTime,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
    completed_at: Option<OffsetDateTime>,
    closed_at_cursor: Option<i64>,
}

#[derive(Debug, FromRow)]
struct NoteRow {
    ticket_id: Uuid,
    text: String,
    author: Uuid,
    created_at: OffsetDateTime,
}

impl TicketRow {
    fn into_ticket(self, notes: Vec<TicketNote>) -> Result<Ticket, TicketError> {
        Ok(Ticket {
            ticket_id: TicketId(self.id),
            subject_id: ParticipantId(self.subject_id),
            channel: self.channel,
            conversation_id: self.conversation_id.parse()?,
            status: self.status,
            assigned_operator_id: self.assigned_operator_id.map(ParticipantId),
            priority: self.priority,
            notes,
            last_activity_at: self.last_activity_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            closed_at_cursor: self
                .closed_at_cursor
                .and_then(|c| u64::try_from(c).ok())
                .map(Cursor),
        })
    }
}

impl From<NoteRow> for TicketNote {
    fn from(row: NoteRow) -> Self {
        TicketNote {
            text: row.text,
            author: ParticipantId(row.author),
            at: row.created_at,
        }
    }
}

#[derive(Clone)]
pub struct PgTicketStore {
    pool: PgPool,
}

impl PgTicketStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn notes_for(&self, ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<TicketNote>>, TicketError> {
        let rows = sqlx::query_as::<_, NoteRow>(
            r#"
            SELECT ticket_id, text, author, created_at
            FROM ticket_notes
            WHERE ticket_id = ANY($1)
            ORDER BY id ASC
            "#,
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        let mut notes: HashMap<Uuid, Vec<TicketNote>> = HashMap::new();
        for row in rows {
            notes.entry(row.ticket_id).or_default().push(row.into());
        }
        Ok(notes)
    }

    async fn hydrate(&self, rows: Vec<TicketRow>) -> Result<Vec<Ticket>, TicketError> {
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let mut notes = self.notes_for(&ids).await?;
        rows.into_iter()
            .map(|row| {
                let ticket_notes = notes.remove(&row.id).unwrap_or_default();
                row.into_ticket(ticket_notes)
            })
            .collect()
    }

    async fn hydrate_one(&self, row: Option<TicketRow>) -> Result<Option<Ticket>, TicketError> {
        match row {
            Some(row) => Ok(self.hydrate(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl TicketStore for PgTicketStore {
    async fn get(&self, id: TicketId) -> Result<Option<Ticket>, TicketError> {
        let row = sqlx::query_as::<_, TicketRow>(&format!(
            "SELECT {} FROM tickets WHERE id = $1",
            TICKET_COLUMNS
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        self.hydrate_one(row).await
    }

    async fn find_by_conversation(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<Ticket>, TicketError> {
        let row = sqlx::query_as::<_, TicketRow>(&format!(
            "SELECT {} FROM tickets WHERE conversation_id = $1",
            TICKET_COLUMNS
        ))
        .bind(conversation_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        self.hydrate_one(row).await
    }

    async fn list(&self, status: Option<TicketStatus>) -> Result<Vec<Ticket>, TicketError> {
        let rows = sqlx::query_as::<_, TicketRow>(&format!(
            "SELECT {} FROM tickets WHERE ($1::varchar IS NULL OR status = $1) \
             ORDER BY last_activity_at DESC",
            TICKET_COLUMNS
        ))
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        self.hydrate(rows).await
    }

    async fn insert(&self, ticket: Ticket) -> Result<Ticket, TicketError> {
        sqlx::query(
            r#"
            INSERT INTO tickets (id, subject_id, channel, conversation_id, status,
                                 assigned_operator_id, priority, last_activity_at,
                                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (conversation_id) DO NOTHING
            "#,
        )
        .bind(ticket.ticket_id.0)
        .bind(ticket.subject_id.0)
        .bind(ticket.channel)
        .bind(ticket.conversation_id.as_str())
        .bind(ticket.status)
        .bind(ticket.assigned_operator_id.map(|p| p.0))
        .bind(ticket.priority)
        .bind(ticket.last_activity_at)
        .bind(ticket.created_at)
        .bind(ticket.updated_at)
        .execute(&self.pool)
        .await?;

        self.find_by_conversation(&ticket.conversation_id)
            .await?
            .ok_or(TicketError::NotFound(ticket.ticket_id))
    }

    async fn update(&self, id: TicketId, change: &TicketChange) -> Result<Ticket, TicketError> {
        let (set_assignee, assignee) = match change.assigned_operator_id {
            Some(assignee) => (true, assignee.map(|p| p.0)),
            None => (false, None),
        };
        let closed_at_cursor = change
            .closed_at_cursor
            .map(|c| i64::try_from(c.0))
            .transpose()
            .map_err(|_| TicketError::Validation("closure cursor out of range".to_string()))?;

        let row = sqlx::query_as::<_, TicketRow>(&format!(
            r#"
            UPDATE tickets SET
                status = COALESCE($2, status),
                assigned_operator_id = CASE WHEN $3 THEN $4 ELSE assigned_operator_id END,
                priority = COALESCE($5, priority),
                completed_at = CASE WHEN $2 = 'completed' THEN NOW() ELSE completed_at END,
                closed_at_cursor = CASE
                    WHEN $2 = 'completed' THEN $6
                    WHEN $2 IS NULL THEN closed_at_cursor
                    ELSE NULL
                END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            TICKET_COLUMNS
        ))
        .bind(id.0)
        .bind(change.status)
        .bind(set_assignee)
        .bind(assignee)
        .bind(change.priority)
        .bind(closed_at_cursor)
        .fetch_optional(&self.pool)
        .await?;

        self.hydrate_one(row).await?.ok_or(TicketError::NotFound(id))
    }

    async fn touch(&self, id: TicketId, at: OffsetDateTime) -> Result<(), TicketError> {
        let result = sqlx::query(
            "UPDATE tickets SET last_activity_at = GREATEST(last_activity_at, $2) WHERE id = $1",
        )
        .bind(id.0)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TicketError::NotFound(id));
        }
        Ok(())
    }

    async fn add_note(&self, id: TicketId, note: TicketNote) -> Result<Ticket, TicketError> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query("UPDATE tickets SET updated_at = NOW() WHERE id = $1")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(TicketError::NotFound(id));
        }

        sqlx::query(
            "INSERT INTO ticket_notes (ticket_id, text, author, created_at) VALUES ($1, $2, $3, $4)",
        )
        .bind(id.0)
        .bind(&note.text)
        .bind(note.author.0)
        .bind(note.at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.get(id).await?.ok_or(TicketError::NotFound(id))
    }

    async fn load_cursor(&self, name: &str) -> Result<Cursor, TicketError> {
        let cursor: Option<i64> =
            sqlx::query_scalar("SELECT cursor FROM projector_cursors WHERE name = $1")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?;
        Ok(cursor
            .and_then(|c| u64::try_from(c).ok())
            .map(Cursor)
            .unwrap_or(Cursor::START))
    }

    async fn save_cursor(&self, name: &str, cursor: Cursor) -> Result<(), TicketError> {
        let value = i64::try_from(cursor.0)
            .map_err(|_| TicketError::Validation(format!("cursor {} out of range", cursor)))?;
        sqlx::query(
            r#"
            INSERT INTO projector_cursors (name, cursor) VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET cursor = GREATEST(projector_cursors.cursor, EXCLUDED.cursor)
            "#,
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
