//! WebSocket connection management

use tokio::sync::mpsc;
use uuid::Uuid;

use relaydesk_shared::{ConversationId, Envelope, Handshake, ParticipantId, Role};

/// A connection that completed the handshake
#[derive(Debug)]
pub struct Connection {
    /// Unique session ID for this connection, echoed in the ack
    pub session_id: Uuid,

    /// Identity announced in the `connect` frame
    pub handshake: Handshake,

    /// Channel to send envelopes to this connection
    pub sender: mpsc::UnboundedSender<Envelope>,
}

impl Connection {
    pub fn new(handshake: Handshake, sender: mpsc::UnboundedSender<Envelope>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            handshake,
            sender,
        }
    }

    pub fn subject_id(&self) -> ParticipantId {
        self.handshake.subject_id
    }

    pub fn role(&self) -> Role {
        self.handshake.role
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.handshake.conversation_id()
    }

    /// Send an envelope to this connection
    ///
    /// Returns Err if the connection is closed
    #[allow(clippy::result_large_err)] // Error type is from tokio mpsc, containing the failed envelope
    pub fn send(&self, envelope: Envelope) -> Result<(), mpsc::error::SendError<Envelope>> {
        self.sender.send(envelope)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use relaydesk_shared::Channel;

    #[test]
    fn test_connection_derives_conversation() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let subject = ParticipantId::new();
        let conn = Connection::new(
            Handshake {
                subject_id: subject,
                role: Role::Operator,
                channel: Channel::Operator,
            },
            tx,
        );

        assert_eq!(conn.subject_id(), subject);
        assert_eq!(conn.role(), Role::Operator);
        assert_eq!(
            conn.conversation_id(),
            ConversationId::for_subject(subject, Channel::Operator)
        );
    }

    #[tokio::test]
    async fn test_send_fails_after_receiver_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::new(
            Handshake {
                subject_id: ParticipantId::new(),
                role: Role::User,
                channel: Channel::Assistant,
            },
            tx,
        );
        drop(rx);
        assert!(conn.send(Envelope::error("gone")).is_err());
    }
}
