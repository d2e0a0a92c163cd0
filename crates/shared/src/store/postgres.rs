//! Postgres-backed durable store
//!
//! Messages live in `chat_messages`; the bigserial `seq` column is the
//! cursor. Re-appending an id bumps its `seq`, so pollers see streaming
//! updates as new events. Subscriptions are polling loops.
//!
//! Pollers advance past every `seq` they have seen, so a lower `seq` must
//! never commit after a higher one. Appends therefore take a transaction
//! scoped advisory lock before drawing their `seq`, which makes commit order
//! follow `seq` order.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{AppendAck, Cursor, DurableStore, StoreEvent, StoreStream};
use crate::error::StoreError;
use crate::types::{Channel, ConversationId, Message, MessageId, ParticipantId, Role};

/// Rows fetched per poll
const POLL_BATCH: i64 = 200;

/// Advisory lock key serialising appends to `chat_messages`
const APPEND_LOCK_KEY: i64 = 0x7265_6c61_7964_736b;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    poll_interval: Duration,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    seq: i64,
    id: Uuid,
    conversation_id: String,
    sender_id: Uuid,
    sender_role: Role,
    text: String,
    created_at: OffsetDateTime,
    channel: Channel,
}

impl TryFrom<MessageRow> for StoreEvent {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        let cursor = u64::try_from(row.seq)
            .map_err(|_| StoreError::Corrupt(format!("negative seq {}", row.seq)))?;
        Ok(StoreEvent {
            cursor: Cursor(cursor),
            message: Message {
                id: MessageId(row.id),
                conversation_id: row.conversation_id.parse()?,
                sender_id: ParticipantId(row.sender_id),
                sender_role: row.sender_role,
                text: row.text,
                created_at: row.created_at,
                channel: row.channel,
            },
        })
    }
}

struct PollState {
    pool: PgPool,
    conversation_id: Option<ConversationId>,
    cursor: Cursor,
    buffer: VecDeque<StoreEvent>,
    interval: Duration,
}

impl PgStore {
    pub fn new(pool: PgPool, poll_interval: Duration) -> Self {
        Self {
            pool,
            poll_interval,
        }
    }

    fn poll_stream(&self, conversation_id: Option<ConversationId>, since: Cursor) -> StoreStream {
        let state = PollState {
            pool: self.pool.clone(),
            conversation_id,
            cursor: since,
            buffer: VecDeque::new(),
            interval: self.poll_interval,
        };

        Box::pin(futures::stream::unfold(state, |mut st| async move {
            loop {
                if let Some(event) = st.buffer.pop_front() {
                    st.cursor = event.cursor;
                    return Some((Ok(event), st));
                }

                match fetch_after(&st.pool, st.conversation_id.as_ref(), st.cursor).await {
                    Ok(events) if events.is_empty() => tokio::time::sleep(st.interval).await,
                    Ok(events) => st.buffer.extend(events),
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            cursor = %st.cursor,
                            "Store poll failed"
                        );
                        tokio::time::sleep(st.interval).await;
                        return Some((Err(e), st));
                    }
                }
            }
        }))
    }
}

async fn fetch_after(
    pool: &PgPool,
    conversation_id: Option<&ConversationId>,
    cursor: Cursor,
) -> Result<Vec<StoreEvent>, StoreError> {
    let after = i64::try_from(cursor.0).unwrap_or(i64::MAX);
    let rows = sqlx::query_as::<_, MessageRow>(
        r#"
        SELECT seq, id, conversation_id, sender_id, sender_role, text, created_at, channel
        FROM chat_messages
        WHERE seq > $1
          AND ($2::text IS NULL OR conversation_id = $2)
        ORDER BY seq ASC
        LIMIT $3
        "#,
    )
    .bind(after)
    .bind(conversation_id.map(|c| c.as_str().to_string()))
    .bind(POLL_BATCH)
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(StoreEvent::try_from).collect()
}

#[async_trait]
impl DurableStore for PgStore {
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

        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(APPEND_LOCK_KEY)
            .execute(&mut *tx)
            .await?;

        // The store stamps creation time on first insert; updates keep it.
        let (seq, created_at): (i64, OffsetDateTime) = sqlx::query_as(
            r#"
            INSERT INTO chat_messages (id, conversation_id, sender_id, sender_role, text, channel, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW())
            ON CONFLICT (id) DO UPDATE SET
              text = EXCLUDED.text,
              seq = nextval(pg_get_serial_sequence('chat_messages', 'seq'))
            RETURNING seq, created_at
            "#,
        )
        .bind(message.id.0)
        .bind(conversation_id.as_str())
        .bind(message.sender_id.0)
        .bind(message.sender_role)
        .bind(&message.text)
        .bind(message.channel)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let cursor = u64::try_from(seq)
            .map_err(|_| StoreError::Corrupt(format!("negative seq {}", seq)))?;

        tracing::debug!(
            conversation_id = %conversation_id,
            message_id = %message.id,
            cursor = cursor,
            "Message appended"
        );

        Ok(AppendAck {
            cursor: Cursor(cursor),
            created_at,
        })
    }

    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
        since: Cursor,
    ) -> Result<StoreStream, StoreError> {
        Ok(self.poll_stream(Some(conversation_id.clone()), since))
    }

    async fn subscribe_all(&self, since: Cursor) -> Result<StoreStream, StoreError> {
        Ok(self.poll_stream(None, since))
    }
}
