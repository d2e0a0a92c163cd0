//! Wire envelopes exchanged over the transport connection
//!
//! Every frame is a JSON object tagged by `kind`. Both the relay server and
//! the session client speak this format.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RelayError;
use crate::types::{
    Channel, ConversationId, Message, ParticipantId, Role, TicketId, TicketPriority, TicketStatus,
};

/// A single transport frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Envelope {
    /// First frame on every connection (client -> transport)
    Connect(Handshake),

    /// Handshake acknowledgement (transport -> client)
    Ack {
        #[serde(rename = "sessionId")]
        session_id: Uuid,
    },

    /// A chat message, in either direction
    Message(Message),

    /// Ephemeral typing signal, never stored
    Typing(TypingSignal),

    /// Ticket status/assignment changed (transport -> client)
    TicketUpdated(TicketUpdate),

    /// Non-fatal error notification (transport -> client)
    Error { message: String },
}

impl Envelope {
    /// Parse a text frame
    pub fn from_json(text: &str) -> Result<Self, RelayError> {
        serde_json::from_str(text).map_err(|e| RelayError::MalformedEnvelope(e.to_string()))
    }

    /// Serialize into a text frame
    pub fn to_json(&self) -> Result<String, RelayError> {
        serde_json::to_string(self).map_err(|e| RelayError::Internal(e.to_string()))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Connect(_) => "connect",
            Envelope::Ack { .. } => "ack",
            Envelope::Message(_) => "message",
            Envelope::Typing(_) => "typing",
            Envelope::TicketUpdated(_) => "ticket_updated",
            Envelope::Error { .. } => "error",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Envelope::Error {
            message: message.into(),
        }
    }
}

/// Session identification sent on open
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub subject_id: ParticipantId,
    pub role: Role,
    pub channel: Channel,
}

impl Handshake {
    pub fn conversation_id(&self) -> ConversationId {
        ConversationId::for_subject(self.subject_id, self.channel)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingSignal {
    pub conversation_id: ConversationId,
    pub sender_id: ParticipantId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketUpdate {
    pub ticket_id: TicketId,
    pub conversation_id: ConversationId,
    pub status: TicketStatus,
    pub assigned_operator_id: Option<ParticipantId>,
    pub priority: TicketPriority,
}
