//! WebSocket handler for Axum
//!
//! The first frame on every socket must be a `connect` handshake, answered
//! with an `ack`. After that the connection sits in its conversation room:
//! `message` and `typing` frames are relayed to the other connections of the
//! same conversation, anything else is answered with an `error` envelope.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{stream::StreamExt, SinkExt};
use tokio::sync::mpsc;

use relaydesk_shared::{Envelope, Handshake};

use crate::state::AppState;

use super::{connection::Connection, state::WebSocketState};

/// WebSocket handler - upgrades HTTP connection to WebSocket
pub async fn ws_handler(ws: WebSocketUpgrade, State(app_state): State<AppState>) -> Response {
    let timeout = app_state.config.handshake_timeout();
    let ws_state = app_state.ws_state.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, ws_state, timeout))
}

/// Handle individual WebSocket connection
async fn handle_socket(mut socket: WebSocket, ws_state: WebSocketState, timeout: Duration) {
    let Some(handshake) = await_handshake(&mut socket, timeout).await else {
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    let (mut sender, mut receiver) = socket.split();

    // Create channel for sending envelopes to this connection
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

    let conn = ws_state.add_connection(Connection::new(handshake, tx)).await;
    let session_id = conn.session_id;
    let _ = conn.send(Envelope::Ack { session_id });

    // Spawn task to send envelopes to client
    let send_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            match envelope.to_json() {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break; // Connection closed
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize envelope");
                }
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(session_id = %session_id, error = %e, "WebSocket receive error");
                break;
            }
        };

        match msg {
            Message::Text(text) => match Envelope::from_json(&text) {
                Ok(envelope) => handle_envelope(envelope, &conn, &ws_state).await,
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Discarding malformed envelope");
                    let _ = conn.send(Envelope::error("Invalid envelope format"));
                }
            },
            Message::Close(_) => {
                tracing::info!(session_id = %session_id, "WebSocket close frame received");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // Axum handles ping/pong automatically
            }
            Message::Binary(_) => {
                let _ = conn.send(Envelope::error("Binary frames are not supported"));
            }
        }
    }

    // Cleanup on disconnect
    tracing::info!(
        session_id = %session_id,
        conversation_id = %conn.conversation_id(),
        "WebSocket connection closing"
    );
    ws_state.remove_connection(&session_id).await;
    send_task.abort();
}

/// Wait for the `connect` frame. Returns None when the client sent something
/// else, went away, or missed the deadline.
async fn await_handshake(socket: &mut WebSocket, timeout: Duration) -> Option<Handshake> {
    let first = tokio::time::timeout(timeout, async {
        loop {
            match socket.recv().await {
                Some(Ok(Message::Text(text))) => return Some(text),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(_)) | Some(Err(_)) | None => return None,
            }
        }
    })
    .await;

    let text = match first {
        Ok(Some(text)) => text,
        Ok(None) => {
            tracing::debug!("WebSocket closed before handshake");
            return None;
        }
        Err(_) => {
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "WebSocket handshake timed out");
            let _ = send_direct(socket, Envelope::error("Handshake timed out")).await;
            return None;
        }
    };

    match Envelope::from_json(&text) {
        Ok(Envelope::Connect(handshake)) => Some(handshake),
        Ok(other) => {
            tracing::warn!(kind = other.kind(), "First frame was not a handshake");
            let _ = send_direct(socket, Envelope::error("Expected connect handshake")).await;
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "Malformed handshake");
            let _ = send_direct(socket, Envelope::error("Invalid envelope format")).await;
            None
        }
    }
}

async fn send_direct(socket: &mut WebSocket, envelope: Envelope) -> Result<(), axum::Error> {
    match envelope.to_json() {
        Ok(json) => socket.send(Message::Text(json)).await,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize envelope");
            Ok(())
        }
    }
}

/// Route one inbound envelope from a handshaken connection
async fn handle_envelope(envelope: Envelope, conn: &Arc<Connection>, ws_state: &WebSocketState) {
    let conversation_id = conn.conversation_id();

    let target = match &envelope {
        Envelope::Message(message) => &message.conversation_id,
        Envelope::Typing(signal) => &signal.conversation_id,
        Envelope::Connect(_) => {
            let _ = conn.send(Envelope::error("Connection already established"));
            return;
        }
        other => {
            tracing::warn!(
                session_id = %conn.session_id,
                kind = other.kind(),
                "Unexpected envelope from client"
            );
            let _ = conn.send(Envelope::error(format!(
                "Clients may not send {} envelopes",
                other.kind()
            )));
            return;
        }
    };

    if target != &conversation_id {
        tracing::warn!(
            session_id = %conn.session_id,
            conversation_id = %conversation_id,
            target = %target,
            "Envelope addressed to another conversation"
        );
        let _ = conn.send(Envelope::error("Envelope does not belong to this conversation"));
        return;
    }

    ws_state
        .rooms
        .broadcast_except(&conversation_id, envelope, &conn.session_id)
        .await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{config::Config, routes::create_router, state::AppState};
    use relaydesk_shared::{Channel, ConversationId, Message as ChatMessage, ParticipantId, Role, TypingSignal};
    use tokio::net::TcpStream;
    use tokio_tungstenite::{tungstenite, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn serve(config: Config) -> (String, AppState) {
        let state = AppState::in_memory(config);
        let app = create_router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("ws://{}/ws", addr), state)
    }

    async fn send(client: &mut Client, envelope: &Envelope) {
        client
            .send(tungstenite::Message::Text(envelope.to_json().unwrap().into()))
            .await
            .unwrap();
    }

    async fn recv(client: &mut Client) -> Envelope {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(2), client.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .unwrap();
            if let tungstenite::Message::Text(text) = frame {
                return Envelope::from_json(&text).unwrap();
            }
        }
    }

    async fn quiet(client: &mut Client) -> bool {
        tokio::time::timeout(Duration::from_millis(100), client.next())
            .await
            .is_err()
    }

    async fn join(url: &str, subject: ParticipantId, role: Role) -> Client {
        let (mut client, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        send(
            &mut client,
            &Envelope::Connect(Handshake {
                subject_id: subject,
                role,
                channel: Channel::Operator,
            }),
        )
        .await;
        assert!(matches!(recv(&mut client).await, Envelope::Ack { .. }));
        client
    }

    #[tokio::test]
    async fn test_relays_to_other_connections_of_conversation() {
        let (url, state) = serve(Config::default()).await;
        let subject = ParticipantId::new();
        let mut user = join(&url, subject, Role::User).await;
        let mut operator = join(&url, subject, Role::Operator).await;
        let mut stranger = join(&url, ParticipantId::new(), Role::User).await;

        let message = ChatMessage::new(subject, Channel::Operator, subject, Role::User, "hello");
        send(&mut user, &Envelope::Message(message.clone())).await;
        assert_eq!(recv(&mut operator).await, Envelope::Message(message));

        let typing = Envelope::Typing(TypingSignal {
            conversation_id: ConversationId::for_subject(subject, Channel::Operator),
            sender_id: subject,
        });
        send(&mut user, &typing).await;
        assert_eq!(recv(&mut operator).await, typing);

        // Neither the origin nor another conversation receives the relay
        assert!(quiet(&mut user).await);
        assert!(quiet(&mut stranger).await);

        // A second handshake on a live connection is refused
        send(
            &mut stranger,
            &Envelope::Connect(Handshake {
                subject_id: subject,
                role: Role::User,
                channel: Channel::Operator,
            }),
        )
        .await;
        assert!(matches!(recv(&mut stranger).await, Envelope::Error { .. }));

        let stats = state.ws_state.get_stats().await;
        assert_eq!(stats.active_connections, 3);
        assert_eq!(stats.active_rooms, 2);
    }

    #[tokio::test]
    async fn test_malformed_envelope_answered_with_error() {
        let (url, _state) = serve(Config::default()).await;
        let subject = ParticipantId::new();
        let mut user = join(&url, subject, Role::User).await;

        user.send(tungstenite::Message::Text("{not json".into())).await.unwrap();
        assert!(matches!(recv(&mut user).await, Envelope::Error { .. }));

        // Connection stays usable
        let foreign = ChatMessage::new(ParticipantId::new(), Channel::Operator, subject, Role::User, "x");
        send(&mut user, &Envelope::Message(foreign)).await;
        assert!(matches!(recv(&mut user).await, Envelope::Error { .. }));
    }

    #[tokio::test]
    async fn test_first_frame_must_be_handshake() {
        let (url, state) = serve(Config::default()).await;
        let (mut client, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        send(&mut client, &Envelope::error("hi")).await;
        assert!(matches!(recv(&mut client).await, Envelope::Error { .. }));
        assert_eq!(state.ws_state.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let config = Config {
            handshake_timeout_ms: 50,
            ..Config::default()
        };
        let (url, state) = serve(config).await;
        let (mut client, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        match recv(&mut client).await {
            Envelope::Error { message } => assert!(message.contains("timed out")),
            other => panic!("Expected error, got {:?}", other),
        }
        assert_eq!(state.ws_state.connection_count().await, 0);
    }
}
