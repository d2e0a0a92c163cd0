//! Typing presence
//!
//! Presence is ephemeral. A typing signal marks its sender as typing until the
//! timeout elapses without a fresh signal, or until a real message from that
//! sender arrives.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use relaydesk_shared::{ConversationId, ParticipantId};

/// Default inactivity window after which a typing flag clears
pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    pub conversation_id: ConversationId,
    pub sender_id: ParticipantId,
    pub is_typing: bool,
    pub expires_at: Instant,
}

#[derive(Debug)]
pub struct PresenceTracker {
    timeout: Duration,
    expiries: HashMap<(ConversationId, ParticipantId), Instant>,
}

impl PresenceTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            expiries: HashMap::new(),
        }
    }

    /// Record a typing signal received at `now`
    pub fn refresh(&mut self, conversation_id: &ConversationId, sender_id: ParticipantId, now: Instant) {
        self.expiries
            .insert((conversation_id.clone(), sender_id), now + self.timeout);
    }

    /// A real message from the sender ends their typing state
    pub fn clear_sender(&mut self, conversation_id: &ConversationId, sender_id: ParticipantId) {
        self.expiries.remove(&(conversation_id.clone(), sender_id));
    }

    pub fn clear_conversation(&mut self, conversation_id: &ConversationId) {
        self.expiries.retain(|(conv, _), _| conv != conversation_id);
    }

    pub fn is_typing(&self, conversation_id: &ConversationId, now: Instant) -> bool {
        self.expiries
            .iter()
            .any(|((conv, _), expires_at)| conv == conversation_id && *expires_at > now)
    }

    /// Senders currently typing, in id order
    pub fn typists(&self, conversation_id: &ConversationId, now: Instant) -> Vec<ParticipantId> {
        let mut senders: Vec<_> = self
            .expiries
            .iter()
            .filter(|((conv, _), expires_at)| conv == conversation_id && **expires_at > now)
            .map(|((_, sender), _)| *sender)
            .collect();
        senders.sort();
        senders
    }

    pub fn snapshot(&self, conversation_id: &ConversationId, now: Instant) -> Vec<Presence> {
        let mut out: Vec<_> = self
            .expiries
            .iter()
            .filter(|((conv, _), _)| conv == conversation_id)
            .map(|((conv, sender), expires_at)| Presence {
                conversation_id: conv.clone(),
                sender_id: *sender,
                is_typing: *expires_at > now,
                expires_at: *expires_at,
            })
            .collect();
        out.sort_by_key(|p| p.sender_id);
        out
    }

    /// Drop expired entries
    pub fn prune(&mut self, now: Instant) {
        self.expiries.retain(|_, expires_at| *expires_at > now);
    }
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TYPING_TIMEOUT)
    }
}
