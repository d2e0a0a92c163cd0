//! Global WebSocket state management

use std::collections::HashMap;
use std::sync::Arc;
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::connection::Connection;
use super::room::RoomManager;

/// Global WebSocket state shared across all connections
#[derive(Clone)]
pub struct WebSocketState {
    /// All active connections indexed by session_id
    pub connections: Arc<RwLock<HashMap<Uuid, Arc<Connection>>>>,

    /// Room manager for conversation fan-out
    pub rooms: Arc<RoomManager>,
}

impl WebSocketState {
    pub fn new() -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            rooms: Arc::new(RoomManager::new()),
        }
    }

    /// Register a handshaken connection and join its conversation room
    pub async fn add_connection(&self, conn: Connection) -> Arc<Connection> {
        let conn = Arc::new(conn);
        let total = {
            let mut connections = self.connections.write().await;
            connections.insert(conn.session_id, Arc::clone(&conn));
            connections.len()
        };
        self.rooms.join(conn.conversation_id(), Arc::clone(&conn)).await;

        tracing::info!(
            session_id = %conn.session_id,
            subject_id = %conn.subject_id(),
            role = %conn.role(),
            conversation_id = %conn.conversation_id(),
            total_connections = total,
            "WebSocket connection added"
        );

        conn
    }

    pub async fn remove_connection(&self, session_id: &Uuid) {
        let removed = {
            let mut connections = self.connections.write().await;
            connections.remove(session_id).map(|conn| (conn, connections.len()))
        };
        if let Some((conn, remaining)) = removed {
            self.rooms.remove_connection(session_id).await;

            tracing::info!(
                session_id = %session_id,
                conversation_id = %conn.conversation_id(),
                remaining_connections = remaining,
                "WebSocket connection removed"
            );
        }
    }

    pub async fn get_connection(&self, session_id: &Uuid) -> Option<Arc<Connection>> {
        self.connections.read().await.get(session_id).cloned()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn get_stats(&self) -> WebSocketStats {
        WebSocketStats {
            active_connections: self.connection_count().await,
            active_rooms: self.rooms.get_room_count().await,
        }
    }
}

impl Default for WebSocketState {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about WebSocket connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WebSocketStats {
    pub active_connections: usize,
    /// Conversations with at least one live connection
    pub active_rooms: usize,
}
