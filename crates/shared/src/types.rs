//! Common types used across RelayDesk

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::RelayError;
use crate::store::Cursor;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Opaque identity supplied by the surrounding product.
///
/// Subjects, operators and assistants all live in the same id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub Uuid);

impl ParticipantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Sender id used for synthetic `system` messages
    pub const fn system() -> Self {
        Self(Uuid::nil())
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ParticipantId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Message ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for MessageId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Ticket ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(pub Uuid);

impl TicketId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TicketId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TicketId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TicketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Conversation key, derived from `(subject, channel)` as `"{subject}:{channel}"`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn for_subject(subject_id: ParticipantId, channel: Channel) -> Self {
        Self(format!("{}:{}", subject_id, channel))
    }

    /// Split the id back into its subject and channel
    pub fn parts(&self) -> Result<(ParticipantId, Channel), RelayError> {
        let (subject, channel) = self
            .0
            .rsplit_once(':')
            .ok_or_else(|| RelayError::InvalidConversation(self.0.clone()))?;
        let subject = Uuid::parse_str(subject)
            .map_err(|_| RelayError::InvalidConversation(self.0.clone()))?;
        let channel = channel
            .parse()
            .map_err(|_| RelayError::InvalidConversation(self.0.clone()))?;
        Ok((ParticipantId(subject), channel))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ConversationId {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Self(s.to_string());
        id.parts()?;
        Ok(id)
    }
}

// =============================================================================
// Roles and Channels
// =============================================================================

/// Who produced a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Operator,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Operator => "operator",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Self::User),
            "operator" => Ok(Self::Operator),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

/// Logical routing tag for a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Chat handled by the automated assistant
    Assistant,
    /// Chat handled by a human operator
    Operator,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assistant => "assistant",
            Self::Operator => "operator",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "assistant" => Ok(Self::Assistant),
            "operator" => Ok(Self::Operator),
            _ => Err(format!("Invalid channel: {}", s)),
        }
    }
}

// =============================================================================
// Messages
// =============================================================================

/// A single chat message.
///
/// Immutable once created, except that a streaming assistant reply is
/// re-appended under the same `id` with a longer `text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: ParticipantId,
    pub sender_role: Role,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub channel: Channel,
}

impl Message {
    /// Build a new message stamped with the local clock
    pub fn new(
        subject_id: ParticipantId,
        channel: Channel,
        sender_id: ParticipantId,
        sender_role: Role,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id: ConversationId::for_subject(subject_id, channel),
            sender_id,
            sender_role,
            text: text.into(),
            created_at: OffsetDateTime::now_utc(),
            channel,
        }
    }

    /// Build a synthetic `system` message for an existing conversation
    pub fn system(conversation_id: ConversationId, channel: Channel, text: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            sender_id: ParticipantId::system(),
            sender_role: Role::System,
            text: text.into(),
            created_at: OffsetDateTime::now_utc(),
            channel,
        }
    }
}

// =============================================================================
// Tickets
// =============================================================================

/// Operator queue status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "camelCase")]
pub enum TicketStatus {
    Waiting,
    InProgress,
    Completed,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TicketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "in_progress" | "inProgress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid ticket status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TicketPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl TicketPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

/// Append-only operator note attached to a ticket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketNote {
    pub text: String,
    pub author: ParticipantId,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

/// Operator-facing work item derived from a conversation's activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub ticket_id: TicketId,
    pub subject_id: ParticipantId,
    pub channel: Channel,
    pub conversation_id: ConversationId,
    pub status: TicketStatus,
    pub assigned_operator_id: Option<ParticipantId>,
    pub priority: TicketPriority,
    pub notes: Vec<TicketNote>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    /// Set when the ticket last entered `completed`
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    /// Store cursor of the closure message while `completed`. Only user
    /// messages stored after it reopen the ticket.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at_cursor: Option<Cursor>,
}

impl Ticket {
    /// Fresh ticket for a conversation's first message
    pub fn open_for(conversation_id: ConversationId, activity_at: OffsetDateTime) -> Result<Self, RelayError> {
        let (subject_id, channel) = conversation_id.parts()?;
        let now = OffsetDateTime::now_utc();
        Ok(Self {
            ticket_id: TicketId::new(),
            subject_id,
            channel,
            conversation_id,
            status: TicketStatus::Waiting,
            assigned_operator_id: None,
            priority: TicketPriority::default(),
            notes: Vec::new(),
            last_activity_at: activity_at,
            created_at: now,
            updated_at: now,
            completed_at: None,
            closed_at_cursor: None,
        })
    }
}
