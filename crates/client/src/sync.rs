//! Dual-source synchronizer
//!
//! Keeps one ordered view per conversation, fed by the transport relay (fast,
//! lossy) and the durable store (authoritative, possibly late). Every event
//! goes through the deduplicator before it lands in the view.

use std::collections::HashMap;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::time::Instant;

use relaydesk_shared::{ConversationId, Cursor, Envelope, Message, MessageId, StoreEvent};

use crate::dedup::{self, Delivery, MergeOutcome, ViewEntry};
use crate::presence::PresenceTracker;

#[derive(Debug)]
pub struct Synchronizer {
    window: Duration,
    conversations: HashMap<ConversationId, Vec<ViewEntry>>,
    cursors: HashMap<ConversationId, Cursor>,
    presence: PresenceTracker,
    arrivals: u64,
}

enum Incoming {
    Transport(Envelope),
    Store(StoreEvent),
}

impl Synchronizer {
    pub fn new(window: Duration, typing_timeout: Duration) -> Self {
        Self {
            window,
            conversations: HashMap::new(),
            cursors: HashMap::new(),
            presence: PresenceTracker::new(typing_timeout),
            arrivals: 0,
        }
    }

    fn next_arrival(&mut self) -> u64 {
        self.arrivals += 1;
        self.arrivals
    }

    fn merge(&mut self, entry: ViewEntry) -> MergeOutcome {
        let conversation_id = entry.message.conversation_id.clone();
        let view = self.conversations.entry(conversation_id).or_default();
        dedup::merge_into(view, entry, self.window)
    }

    /// Optimistic insert of a message this session is sending
    pub fn apply_local(&mut self, message: Message) -> MergeOutcome {
        let arrival = self.next_arrival();
        self.merge(ViewEntry::local(message, arrival))
    }

    /// Apply a transport envelope. Returns `None` for envelopes that do not
    /// touch the view.
    pub fn apply_transport(&mut self, envelope: &Envelope) -> Option<MergeOutcome> {
        match envelope {
            Envelope::Message(message) => {
                self.presence
                    .clear_sender(&message.conversation_id, message.sender_id);
                let arrival = self.next_arrival();
                Some(self.merge(ViewEntry::transport(message.clone(), arrival)))
            }
            Envelope::Typing(signal) => {
                self.presence
                    .refresh(&signal.conversation_id, signal.sender_id, Instant::now());
                None
            }
            _ => None,
        }
    }

    pub fn apply_store(&mut self, event: StoreEvent) -> MergeOutcome {
        let StoreEvent { cursor, message } = event;
        let last = self.cursors.entry(message.conversation_id.clone()).or_default();
        *last = (*last).max(cursor);

        self.presence
            .clear_sender(&message.conversation_id, message.sender_id);
        let arrival = self.next_arrival();
        let outcome = self.merge(ViewEntry::stored(message, cursor, arrival));
        tracing::trace!(cursor = %cursor, outcome = ?outcome, "Store event applied");
        outcome
    }

    /// The store acknowledged our append; the message is durable
    pub fn confirm(&mut self, conversation_id: &ConversationId, id: MessageId) -> bool {
        self.set_delivery(conversation_id, id, Delivery::Confirmed)
    }

    /// Append failed; keep the optimistic copy, flagged
    pub fn mark_failed(&mut self, conversation_id: &ConversationId, id: MessageId) -> bool {
        self.set_delivery(conversation_id, id, Delivery::Failed)
    }

    fn set_delivery(&mut self, conversation_id: &ConversationId, id: MessageId, state: Delivery) -> bool {
        let Some(entry) = self
            .conversations
            .get_mut(conversation_id)
            .and_then(|view| view.iter_mut().find(|e| e.message.id == id))
        else {
            return false;
        };
        // A store copy already confirmed it
        if entry.delivery == Some(Delivery::Confirmed) {
            return state == Delivery::Confirmed;
        }
        entry.delivery = Some(state);
        true
    }

    pub fn view(&self, conversation_id: &ConversationId) -> &[ViewEntry] {
        self.conversations
            .get(conversation_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        self.view(conversation_id)
            .iter()
            .map(|e| e.message.clone())
            .collect()
    }

    pub fn typing_indicator(&self, conversation_id: &ConversationId) -> bool {
        self.typing_indicator_at(conversation_id, Instant::now())
    }

    pub fn typing_indicator_at(&self, conversation_id: &ConversationId, now: Instant) -> bool {
        self.presence.is_typing(conversation_id, now)
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Highest store cursor applied for the conversation
    pub fn last_cursor(&self, conversation_id: &ConversationId) -> Cursor {
        self.cursors
            .get(conversation_id)
            .copied()
            .unwrap_or(Cursor::START)
    }

    /// Drop everything held for the conversation
    pub fn clear(&mut self, conversation_id: &ConversationId) {
        self.conversations.remove(conversation_id);
        self.cursors.remove(conversation_id);
        self.presence.clear_conversation(conversation_id);
        self.presence.prune(Instant::now());
    }

    /// Drain both sources into the view, in whatever order they interleave
    pub async fn merge_streams<T, S>(&mut self, transport: T, store: S)
    where
        T: Stream<Item = Envelope> + Unpin,
        S: Stream<Item = StoreEvent> + Unpin,
    {
        let mut incoming = futures::stream::select(
            transport.map(Incoming::Transport),
            store.map(Incoming::Store),
        );
        while let Some(event) = incoming.next().await {
            match event {
                Incoming::Transport(envelope) => {
                    self.apply_transport(&envelope);
                }
                Incoming::Store(event) => {
                    self.apply_store(event);
                }
            }
        }
    }
}

impl Default for Synchronizer {
    fn default() -> Self {
        Self::new(
            crate::dedup::DEFAULT_DEDUP_WINDOW,
            crate::presence::DEFAULT_TYPING_TIMEOUT,
        )
    }
}
