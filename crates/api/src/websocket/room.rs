//! Conversation room management for pub/sub
//!
//! Every connection joins the room of the conversation named in its
//! handshake. Envelopes are fanned out to the room.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use relaydesk_shared::{ConversationId, Envelope};

use super::connection::Connection;

/// Manages conversation "rooms" for relaying envelopes
pub struct RoomManager {
    /// Map of conversation_id -> list of connections
    rooms: Arc<RwLock<HashMap<ConversationId, Vec<Arc<Connection>>>>>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Add a connection to a conversation room
    pub async fn join(&self, conversation_id: ConversationId, conn: Arc<Connection>) {
        let mut rooms = self.rooms.write().await;
        let room = rooms.entry(conversation_id.clone()).or_default();
        room.push(Arc::clone(&conn));

        tracing::debug!(
            conversation_id = %conversation_id,
            session_id = %conn.session_id,
            room_size = room.len(),
            "Connection joined conversation room"
        );
    }

    /// Remove a connection from a conversation room
    pub async fn leave(&self, conversation_id: &ConversationId, session_id: &Uuid) {
        let mut rooms = self.rooms.write().await;
        if let Some(conns) = rooms.get_mut(conversation_id) {
            conns.retain(|c| c.session_id != *session_id);

            if conns.is_empty() {
                rooms.remove(conversation_id);
                tracing::debug!(conversation_id = %conversation_id, "Removed empty conversation room");
            } else {
                tracing::debug!(
                    conversation_id = %conversation_id,
                    session_id = %session_id,
                    room_size = conns.len(),
                    "Connection left conversation room"
                );
            }
        }
    }

    /// Send an envelope to every connection in a room
    pub async fn broadcast(&self, conversation_id: &ConversationId, envelope: Envelope) -> usize {
        self.fan_out(conversation_id, envelope, None).await
    }

    /// Send an envelope to every connection in a room except its origin
    pub async fn broadcast_except(
        &self,
        conversation_id: &ConversationId,
        envelope: Envelope,
        origin: &Uuid,
    ) -> usize {
        self.fan_out(conversation_id, envelope, Some(origin)).await
    }

    /// Silently skips closed connections; the handler cleans them up
    async fn fan_out(
        &self,
        conversation_id: &ConversationId,
        envelope: Envelope,
        skip: Option<&Uuid>,
    ) -> usize {
        let rooms = self.rooms.read().await;
        let Some(conns) = rooms.get(conversation_id) else {
            tracing::debug!(
                conversation_id = %conversation_id,
                kind = envelope.kind(),
                "No live connections in conversation room"
            );
            return 0;
        };

        let mut delivered = 0;
        let mut failed = 0;
        for conn in conns.iter().filter(|c| Some(&c.session_id) != skip) {
            match conn.send(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    failed += 1;
                    tracing::warn!(
                        session_id = %conn.session_id,
                        "Failed to send envelope to connection (likely closed)"
                    );
                }
            }
        }

        tracing::debug!(
            conversation_id = %conversation_id,
            kind = envelope.kind(),
            recipients = delivered,
            failed = failed,
            "Relayed envelope to conversation room"
        );
        delivered
    }

    /// Remove a connection from all rooms
    pub async fn remove_connection(&self, session_id: &Uuid) {
        let mut rooms = self.rooms.write().await;
        let mut removed_from = 0;

        for conns in rooms.values_mut() {
            let before_len = conns.len();
            conns.retain(|c| c.session_id != *session_id);
            if conns.len() < before_len {
                removed_from += 1;
            }
        }
        rooms.retain(|_, conns| !conns.is_empty());

        if removed_from > 0 {
            tracing::debug!(
                session_id = %session_id,
                room_count = removed_from,
                "Removed connection from rooms"
            );
        }
    }

    pub async fn get_room_size(&self, conversation_id: &ConversationId) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(conversation_id).map(|v| v.len()).unwrap_or(0)
    }

    pub async fn get_room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}
