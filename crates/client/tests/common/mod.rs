//! Loopback relay and store doubles for session tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use relaydesk_client::{
    ChannelTransport, ClientConfig, ConnectionManager, Participant, Session, SessionEvent,
    TransportLink,
};
use relaydesk_shared::{
    AppendAck, Channel, ConversationId, Cursor, DurableStore, Envelope, MemoryStore, Message,
    StoreError, StoreStream,
};

type Rooms = Arc<Mutex<HashMap<ConversationId, Vec<(Uuid, mpsc::Sender<String>)>>>>;

/// Minimal relay: acks handshakes and fans message/typing frames out to the
/// other links of the same conversation.
#[derive(Clone)]
pub struct LoopbackRelay {
    /// When set, chat messages are not relayed (store still has them)
    pub drop_messages: Arc<AtomicBool>,
}

impl LoopbackRelay {
    pub fn start() -> (Self, ConnectionManager) {
        let (transport, accepted) = ChannelTransport::new();
        let relay = Self {
            drop_messages: Arc::new(AtomicBool::new(false)),
        };
        tokio::spawn(relay.clone().accept(accepted));
        let manager = ConnectionManager::new(Arc::new(transport), ClientConfig::default().connection);
        (relay, manager)
    }

    async fn accept(self, mut accepted: mpsc::UnboundedReceiver<TransportLink>) {
        let rooms: Rooms = Arc::new(Mutex::new(HashMap::new()));
        while let Some(link) = accepted.recv().await {
            tokio::spawn(self.clone().serve(link, rooms.clone()));
        }
    }

    async fn serve(self, mut link: TransportLink, rooms: Rooms) {
        let Some(first) = link.inbound.recv().await else {
            return;
        };
        let Ok(Envelope::Connect(handshake)) = Envelope::from_json(&first) else {
            let _ = link.send_envelope(&Envelope::error("handshake required")).await;
            return;
        };
        let conversation_id = handshake.conversation_id();
        let id = Uuid::new_v4();
        rooms
            .lock()
            .await
            .entry(conversation_id.clone())
            .or_default()
            .push((id, link.outbound.clone()));
        let _ = link.send_envelope(&Envelope::Ack { session_id: id }).await;

        while let Some(text) = link.inbound.recv().await {
            let relay = match Envelope::from_json(&text) {
                Ok(Envelope::Message(_)) => !self.drop_messages.load(Ordering::SeqCst),
                Ok(Envelope::Typing(_)) => true,
                _ => false,
            };
            if !relay {
                continue;
            }
            let peers: Vec<_> = rooms
                .lock()
                .await
                .get(&conversation_id)
                .map(|members| {
                    members
                        .iter()
                        .filter(|(member, _)| *member != id)
                        .map(|(_, tx)| tx.clone())
                        .collect()
                })
                .unwrap_or_default();
            for peer in peers {
                let _ = peer.send(text.clone()).await;
            }
        }

        if let Some(members) = rooms.lock().await.get_mut(&conversation_id) {
            members.retain(|(member, _)| *member != id);
        }
    }
}

/// Store whose next `failures` appends fail
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub failures: AtomicUsize,
}

impl FlakyStore {
    pub fn new(failures: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl DurableStore for FlakyStore {
    async fn append(
        &self,
        conversation_id: &ConversationId,
        message: &Message,
    ) -> Result<AppendAck, StoreError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("disk on fire".to_string()));
        }
        self.inner.append(conversation_id, message).await
    }

    async fn subscribe(
        &self,
        conversation_id: &ConversationId,
        since: Cursor,
    ) -> Result<StoreStream, StoreError> {
        self.inner.subscribe(conversation_id, since).await
    }

    async fn subscribe_all(&self, since: Cursor) -> Result<StoreStream, StoreError> {
        self.inner.subscribe_all(since).await
    }
}

pub async fn open(
    manager: &ConnectionManager,
    store: Arc<dyn DurableStore>,
    participant: Participant,
    channel: Channel,
) -> (Session, mpsc::UnboundedReceiver<SessionEvent>) {
    let (session, events) = Session::open(
        participant,
        channel,
        manager.clone(),
        store,
        &ClientConfig::default(),
    )
    .await
    .unwrap();
    assert_eq!(session.ready().await, relaydesk_client::SocketState::Open);
    (session, events)
}

/// Poll the session view until `pred` holds
pub async fn wait_until(session: &Session, pred: impl Fn(&[Message]) -> bool) -> Vec<Message> {
    for _ in 0..300 {
        let messages = session.messages().await;
        if pred(&messages) {
            return messages;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "View never converged; last view: {:?}",
        session
            .messages()
            .await
            .iter()
            .map(|m| m.text.clone())
            .collect::<Vec<_>>()
    );
}

pub fn texts(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.text.as_str()).collect()
}
