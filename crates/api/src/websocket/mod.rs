//! WebSocket relay transport
//!
//! Carries the envelope protocol between live sessions. Nothing here is
//! durable: messages are persisted by the sending client, and the relay only
//! fans frames out to the other connections of the same conversation.
//!
//! # Architecture
//!
//! - **Connection**: A handshaken WebSocket connection
//! - **Room**: Conversation-keyed pub/sub for relaying envelopes
//! - **State**: Global WebSocket state shared across all connections
//! - **Handler**: Axum WebSocket route handler

pub mod connection;
pub mod handler;
pub mod room;
pub mod state;

pub use connection::Connection;
pub use handler::ws_handler;
pub use state::{WebSocketState, WebSocketStats};
