//! RelayDesk session client
//!
//! The client side of a live conversation: a connection manager that keeps
//! the transport up, a synchronizer that merges transport and durable-store
//! events into one ordered view, and the [`Session`] that ties them together.

pub mod config;
pub mod connection;
pub mod dedup;
pub mod error;
pub mod presence;
pub mod router;
pub mod session;
pub mod sync;
pub mod transport;

pub use config::{ClientConfig, ConfigError};
pub use connection::{
    ConnectionConfig, ConnectionEvent, ConnectionHandle, ConnectionManager, LifecycleEvent,
    SocketState,
};
pub use dedup::{dedup, identity_of, Delivery, IdentityKey, MergeOutcome, Source, ViewEntry};
pub use error::{ClientError, SendError};
pub use presence::{Presence, PresenceTracker};
pub use session::{Participant, Session, SessionEvent};
pub use sync::Synchronizer;
pub use transport::{ChannelTransport, Transport, TransportLink, WsTransport};

/// Connect a session to the relay at `config.ws_url`
pub async fn connect_ws(
    participant: Participant,
    channel: relaydesk_shared::Channel,
    store: std::sync::Arc<dyn relaydesk_shared::DurableStore>,
    config: &ClientConfig,
) -> Result<(Session, tokio::sync::mpsc::UnboundedReceiver<SessionEvent>), ClientError> {
    let transport = std::sync::Arc::new(WsTransport::new(config.ws_url.clone()));
    let manager = ConnectionManager::new(transport, config.connection.clone());
    Session::open(participant, channel, manager, store, config).await
}
