//! Session
//!
//! A [`Session`] is one participant's live view of one conversation. It owns
//! its connection handle, its store subscription and its synchronizer; there
//! is no process-wide state. Two background tasks feed the synchronizer:
//!
//! - the pump, draining [`ConnectionEvent`]s from the connection manager
//! - the store follower, tailing the durable store from the last cursor
//!
//! Both are cancelled through one [`CancellationToken`] when the session
//! detaches (close or channel switch).

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;
use tokio_util::sync::CancellationToken;

use relaydesk_shared::{
    Channel, ConversationId, DurableStore, Envelope, Message, ParticipantId, Role, StoreError,
    TicketUpdate, TypingSignal,
};

use crate::config::ClientConfig;
use crate::connection::{ConnectionEvent, ConnectionHandle, ConnectionManager, LifecycleEvent, SocketState};
use crate::dedup::ViewEntry;
use crate::error::{ClientError, SendError};
use crate::sync::Synchronizer;

/// Delay before re-subscribing after the store stream broke
const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(500);

/// Who is speaking in a session, and about whom
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Participant {
    /// Owner of the conversation
    pub subject_id: ParticipantId,
    /// Author of messages sent through this session
    pub sender_id: ParticipantId,
    pub role: Role,
}

impl Participant {
    /// An end user talking in their own conversation
    pub fn user(subject_id: ParticipantId) -> Self {
        Self {
            subject_id,
            sender_id: subject_id,
            role: Role::User,
        }
    }

    /// Someone else (operator, assistant) joining the subject's conversation
    pub fn joining(subject_id: ParticipantId, sender_id: ParticipantId, role: Role) -> Self {
        Self {
            subject_id,
            sender_id,
            role,
        }
    }
}

/// Caller-visible session notifications
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connection(LifecycleEvent),
    /// `error` envelope relayed from the far end
    Notice(String),
    TicketUpdated(TicketUpdate),
    /// The conversation view changed
    ViewChanged(ConversationId),
}

struct Attachment {
    conversation_id: ConversationId,
    handle: ConnectionHandle,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

pub struct Session {
    participant: Participant,
    pub(crate) channel: Channel,
    manager: ConnectionManager,
    store: Arc<dyn DurableStore>,
    pub(crate) sync: Arc<Mutex<Synchronizer>>,
    append_retries: usize,
    events: mpsc::UnboundedSender<SessionEvent>,
    attachment: Option<Attachment>,
}

impl Session {
    /// Connect and start following the conversation for `(participant, channel)`
    pub async fn open(
        participant: Participant,
        channel: Channel,
        manager: ConnectionManager,
        store: Arc<dyn DurableStore>,
        config: &ClientConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>), ClientError> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let mut session = Self {
            participant,
            channel,
            manager,
            store,
            sync: Arc::new(Mutex::new(Synchronizer::new(
                config.dedup_window,
                config.typing_timeout,
            ))),
            append_retries: config.append_retries,
            events,
            attachment: None,
        };
        session.attach().await?;

        tracing::info!(
            subject_id = %participant.subject_id,
            sender_id = %participant.sender_id,
            role = %participant.role,
            channel = %channel,
            "Session opened"
        );

        Ok((session, events_rx))
    }

    pub fn participant(&self) -> Participant {
        self.participant
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn conversation_id(&self) -> ConversationId {
        ConversationId::for_subject(self.participant.subject_id, self.channel)
    }

    pub fn state(&self) -> SocketState {
        self.attachment
            .as_ref()
            .map(|a| a.handle.state())
            .unwrap_or(SocketState::Closed)
    }

    /// Wait until the connection is open, failed or closed
    pub async fn ready(&self) -> SocketState {
        match &self.attachment {
            Some(a) => a.handle.settled().await,
            None => SocketState::Closed,
        }
    }

    /// Restart the connection's attempt budget after `failed`
    pub fn reconnect(&self) -> Result<(), ClientError> {
        match &self.attachment {
            Some(a) => a.handle.reconnect(),
            None => Err(ClientError::Closed),
        }
    }

    /// Send a new text message from this session's participant
    pub async fn send_text(&self, text: impl Into<String>) -> Result<Message, SendError> {
        let message = Message::new(
            self.participant.subject_id,
            self.channel,
            self.participant.sender_id,
            self.participant.role,
            text,
        );
        self.publish(message).await
    }

    /// Send (or update) a message.
    ///
    /// Publishing again under the same id with a longer text is how a
    /// streaming assistant reply is delivered. The message is shown locally
    /// at once, relayed over the transport if open, and appended to the
    /// store. A failed append leaves the local copy marked failed.
    pub async fn publish(&self, mut message: Message) -> Result<Message, SendError> {
        self.stamp(&mut message);
        let conversation_id = message.conversation_id.clone();

        if self.sync.lock().await.apply_local(message.clone()).changed() {
            self.notify(SessionEvent::ViewChanged(conversation_id.clone()));
        }

        if let Some(attachment) = &self.attachment {
            // The store is the record; a closed transport only delays delivery
            if let Err(e) = attachment.handle.send(Envelope::Message(message.clone())) {
                tracing::debug!(
                    message_id = %message.id,
                    error = %e,
                    "Transport send skipped"
                );
            }
        }

        match self.append_with_retry(&conversation_id, &message).await {
            Ok(()) => {
                self.sync.lock().await.confirm(&conversation_id, message.id);
                Ok(message)
            }
            Err(source) => {
                tracing::error!(
                    conversation_id = %conversation_id,
                    message_id = %message.id,
                    error = %source,
                    "Message could not be stored"
                );
                self.sync.lock().await.mark_failed(&conversation_id, message.id);
                self.notify(SessionEvent::ViewChanged(conversation_id));
                Err(SendError { message, source })
            }
        }
    }

    async fn append_with_retry(
        &self,
        conversation_id: &ConversationId,
        message: &Message,
    ) -> Result<(), StoreError> {
        // Retry straight away; the caller is waiting on the send
        let strategy = FixedInterval::new(Duration::ZERO).take(self.append_retries);

        let mut attempt = 0usize;
        let ack = Retry::spawn(strategy, || {
            attempt += 1;
            let attempt = attempt;
            async move {
                self.store
                    .append(conversation_id, message)
                    .await
                    .map_err(|e| {
                        tracing::warn!(
                            message_id = %message.id,
                            attempt = attempt,
                            error = %e,
                            "Append failed"
                        );
                        e
                    })
            }
        })
        .await?;

        tracing::debug!(
            message_id = %message.id,
            cursor = %ack.cursor,
            "Message stored"
        );
        Ok(())
    }

    /// Tell the other participants this session is typing
    pub fn send_typing(&self) -> Result<(), ClientError> {
        let attachment = self.attachment.as_ref().ok_or(ClientError::Closed)?;
        attachment.handle.send(Envelope::Typing(TypingSignal {
            conversation_id: self.conversation_id(),
            sender_id: self.participant.sender_id,
        }))
    }

    /// Ordered, deduplicated messages of the current conversation
    pub async fn messages(&self) -> Vec<Message> {
        self.sync.lock().await.messages(&self.conversation_id())
    }

    pub async fn view(&self) -> Vec<ViewEntry> {
        self.sync.lock().await.view(&self.conversation_id()).to_vec()
    }

    pub async fn typing_indicator(&self) -> bool {
        self.sync.lock().await.typing_indicator(&self.conversation_id())
    }

    /// Disconnect and stop following the store
    pub async fn close(mut self) {
        self.detach().await;
        tracing::info!(
            subject_id = %self.participant.subject_id,
            channel = %self.channel,
            "Session closed"
        );
    }

    fn notify(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) async fn attach(&mut self) -> Result<(), ClientError> {
        let conversation_id = self.conversation_id();
        let since = self.sync.lock().await.last_cursor(&conversation_id);
        let stream = self.store.subscribe(&conversation_id, since).await?;

        let (handle, connection_events) =
            self.manager
                .connect(self.participant.subject_id, self.participant.role, self.channel);
        let cancel = CancellationToken::new();

        let pump = tokio::spawn(pump(
            connection_events,
            conversation_id.clone(),
            Arc::clone(&self.sync),
            self.events.clone(),
            cancel.clone(),
        ));
        let follower = tokio::spawn(follow_store(
            Arc::clone(&self.store),
            stream,
            conversation_id.clone(),
            Arc::clone(&self.sync),
            self.events.clone(),
            cancel.clone(),
        ));

        self.attachment = Some(Attachment {
            conversation_id,
            handle,
            cancel,
            tasks: vec![pump, follower],
        });
        Ok(())
    }

    pub(crate) async fn detach(&mut self) {
        let Some(attachment) = self.attachment.take() else {
            return;
        };
        attachment.cancel.cancel();
        attachment.handle.close().await;
        for task in attachment.tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Session task ended abnormally");
            }
        }
        tracing::debug!(
            conversation_id = %attachment.conversation_id,
            "Session detached"
        );
    }
}

/// Feed connection events into the synchronizer
async fn pump(
    mut connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    conversation_id: ConversationId,
    sync: Arc<Mutex<Synchronizer>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = connection_events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let forward = match event {
            ConnectionEvent::Lifecycle(lifecycle) => Some(SessionEvent::Connection(lifecycle)),
            ConnectionEvent::Notice(message) => Some(SessionEvent::Notice(message)),
            ConnectionEvent::Envelope(Envelope::TicketUpdated(update)) => {
                (update.conversation_id == conversation_id).then_some(SessionEvent::TicketUpdated(update))
            }
            ConnectionEvent::Envelope(envelope) => {
                if !belongs_to(&envelope, &conversation_id) {
                    tracing::debug!(
                        kind = envelope.kind(),
                        conversation_id = %conversation_id,
                        "Dropping envelope for another conversation"
                    );
                    continue;
                }
                let mut sync = sync.lock().await;
                match sync.apply_transport(&envelope) {
                    Some(outcome) if outcome.changed() => {
                        Some(SessionEvent::ViewChanged(conversation_id.clone()))
                    }
                    Some(_) => None,
                    // Typing changes the indicator, which is part of the view
                    None => Some(SessionEvent::ViewChanged(conversation_id.clone())),
                }
            }
        };

        if let Some(event) = forward {
            let _ = events.send(event);
        }
    }
}

fn belongs_to(envelope: &Envelope, conversation_id: &ConversationId) -> bool {
    match envelope {
        Envelope::Message(message) => &message.conversation_id == conversation_id,
        Envelope::Typing(signal) => &signal.conversation_id == conversation_id,
        _ => false,
    }
}

/// Tail the durable store, resubscribing from the last applied cursor when
/// the stream breaks
async fn follow_store(
    store: Arc<dyn DurableStore>,
    mut stream: relaydesk_shared::StoreStream,
    conversation_id: ConversationId,
    sync: Arc<Mutex<Synchronizer>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => return,
            item = stream.next() => item,
        };

        match item {
            Some(Ok(event)) => {
                if event.message.conversation_id != conversation_id {
                    continue;
                }
                if sync.lock().await.apply_store(event).changed() {
                    let _ = events.send(SessionEvent::ViewChanged(conversation_id.clone()));
                }
                continue;
            }
            Some(Err(StoreError::Lagged(skipped))) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    skipped = skipped,
                    "Store subscription lagged, resubscribing"
                );
            }
            Some(Err(e)) => {
                // Polling stores report and keep going
                tracing::warn!(conversation_id = %conversation_id, error = %e, "Store stream error");
                continue;
            }
            None => {
                tracing::debug!(conversation_id = %conversation_id, "Store stream ended, resubscribing");
            }
        }

        stream = loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
            }
            let since = sync.lock().await.last_cursor(&conversation_id);
            match store.subscribe(&conversation_id, since).await {
                Ok(stream) => break stream,
                Err(e) => {
                    tracing::warn!(conversation_id = %conversation_id, error = %e, "Resubscribe failed");
                }
            }
        };
    }
}
