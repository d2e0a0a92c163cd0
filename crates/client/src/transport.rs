//! Transport abstraction
//!
//! A [`Transport`] opens one raw bidirectional text link. The connection
//! manager owns handshaking and reconnects; transports only move frames.
//! A link is considered dropped when its inbound half yields `None`.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};

use relaydesk_shared::Envelope;

use crate::error::ClientError;

/// Frames buffered per direction before the producer waits
const LINK_BUFFER: usize = 256;

/// One open transport link
#[derive(Debug)]
pub struct TransportLink {
    /// Text frames towards the far end
    pub outbound: mpsc::Sender<String>,
    /// Text frames from the far end
    pub inbound: mpsc::Receiver<String>,
}

impl TransportLink {
    /// Two in-process link ends wired to each other
    pub fn pair() -> (TransportLink, TransportLink) {
        let (a_tx, a_rx) = mpsc::channel(LINK_BUFFER);
        let (b_tx, b_rx) = mpsc::channel(LINK_BUFFER);
        (
            TransportLink {
                outbound: a_tx,
                inbound: b_rx,
            },
            TransportLink {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }

    /// Serialize and send an envelope
    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<(), ClientError> {
        let text = envelope.to_json()?;
        self.outbound
            .send(text)
            .await
            .map_err(|_| ClientError::TransportClosed)
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self) -> Result<TransportLink, ClientError>;
}

/// WebSocket transport to a relay server
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self) -> Result<TransportLink, ClientError> {
        let (socket, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let (mut sink, mut stream) = socket.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(LINK_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<String>(LINK_BUFFER);

        // Writer: ends when the link owner drops its sender
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if sink.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let url = self.url.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        if in_tx.send(text.to_string()).await.is_err() {
                            break; // Link owner went away
                        }
                    }
                    Ok(WsMessage::Close(_)) => {
                        tracing::debug!(url = %url, "WebSocket close frame received");
                        break;
                    }
                    Ok(_) => {} // Ping/pong handled by tungstenite, binary ignored
                    Err(e) => {
                        tracing::warn!(url = %url, error = %e, "WebSocket read failed");
                        break;
                    }
                }
            }
        });

        tracing::debug!(url = %self.url, "WebSocket transport opened");
        Ok(TransportLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

/// In-process transport: each `open` hands the far end of a fresh link pair
/// to whoever holds the acceptor.
pub struct ChannelTransport {
    acceptor: mpsc::UnboundedSender<TransportLink>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportLink>) {
        let (acceptor, accepted) = mpsc::unbounded_channel();
        (Self { acceptor }, accepted)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn open(&self) -> Result<TransportLink, ClientError> {
        let (near, far) = TransportLink::pair();
        self.acceptor
            .send(far)
            .map_err(|_| ClientError::Transport("no acceptor listening".to_string()))?;
        Ok(near)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_link_pair_is_cross_wired() {
        let (near, mut far) = TransportLink::pair();
        near.send_envelope(&Envelope::error("hi")).await.unwrap();
        let text = far.inbound.recv().await.unwrap();
        assert!(matches!(Envelope::from_json(&text).unwrap(), Envelope::Error { .. }));
    }

    #[tokio::test]
    async fn test_channel_transport_hands_out_far_end() {
        let (transport, mut accepted) = ChannelTransport::new();
        let mut near = transport.open().await.unwrap();
        let far = accepted.recv().await.unwrap();

        far.outbound.send("ping".to_string()).await.unwrap();
        assert_eq!(near.inbound.recv().await.unwrap(), "ping");

        drop(far);
        assert!(near.inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_channel_transport_fails_without_acceptor() {
        let (transport, accepted) = ChannelTransport::new();
        drop(accepted);
        assert!(transport.open().await.is_err());
    }
}
