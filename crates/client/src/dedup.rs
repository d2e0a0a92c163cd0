//! Message deduplication
//!
//! The same logical message can reach a session three ways: the local
//! optimistic insert, the transport relay and the durable store. Entries are
//! matched by id, or by content identity `(conversation, sender, text,
//! createdAt bucket)` when a re-delivery carries a fresh id.

use std::cmp::Ordering;
use std::time::Duration;

use time::OffsetDateTime;

use relaydesk_shared::{ConversationId, Cursor, Message, ParticipantId, Role};

/// Default width of a createdAt bucket
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(1);

/// Where a view entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Optimistic insert by this session
    Local,
    Transport,
    /// Authoritative
    Store,
}

/// Delivery state of a message this session sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Pending,
    Confirmed,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewEntry {
    pub message: Message,
    pub source: Source,
    /// Store cursor, once the store has delivered this message
    pub cursor: Option<Cursor>,
    /// Session-local arrival sequence
    pub arrival: u64,
    /// Only set for messages sent by this session
    pub delivery: Option<Delivery>,
}

impl ViewEntry {
    pub fn local(message: Message, arrival: u64) -> Self {
        Self {
            message,
            source: Source::Local,
            cursor: None,
            arrival,
            delivery: Some(Delivery::Pending),
        }
    }

    pub fn transport(message: Message, arrival: u64) -> Self {
        Self {
            message,
            source: Source::Transport,
            cursor: None,
            arrival,
            delivery: None,
        }
    }

    pub fn stored(message: Message, cursor: Cursor, arrival: u64) -> Self {
        Self {
            message,
            source: Source::Store,
            cursor: Some(cursor),
            arrival,
            delivery: None,
        }
    }

    fn order_key(&self) -> (OffsetDateTime, u64, u64) {
        (
            self.message.created_at,
            self.cursor.map(|c| c.0).unwrap_or(u64::MAX),
            self.arrival,
        )
    }
}

/// Content identity of a message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub conversation_id: ConversationId,
    pub sender_id: ParticipantId,
    pub text: String,
    pub bucket: i128,
}

pub fn identity_of(message: &Message, window: Duration) -> IdentityKey {
    IdentityKey {
        conversation_id: message.conversation_id.clone(),
        sender_id: message.sender_id,
        text: message.text.clone(),
        bucket: bucket_of(message.created_at, window),
    }
}

fn bucket_of(at: OffsetDateTime, window: Duration) -> i128 {
    let width = window.as_nanos().max(1) as i128;
    at.unix_timestamp_nanos().div_euclid(width)
}

/// True if `a` and `b` are the same logical message.
///
/// Two distinct ids that both came from the store are never merged; the
/// store has already accepted them as separate messages.
pub fn same_logical(a: &ViewEntry, b: &ViewEntry, window: Duration) -> bool {
    if a.message.id == b.message.id {
        return true;
    }
    if a.source == Source::Store && b.source == Source::Store {
        return false;
    }

    let ka = identity_of(&a.message, window);
    let kb = identity_of(&b.message, window);
    if ka.conversation_id != kb.conversation_id
        || ka.sender_id != kb.sender_id
        || ka.text != kb.text
        || (ka.bucket - kb.bucket).abs() > 1
    {
        return false;
    }

    let delta = (a.message.created_at - b.message.created_at).unsigned_abs();
    delta < window
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New logical message
    Inserted,
    /// Existing entry superseded by a more authoritative copy
    Replaced,
    /// Streaming update folded into the existing entry
    Merged,
    /// Nothing changed
    Duplicate,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        !matches!(self, MergeOutcome::Duplicate)
    }
}

/// Fold `incoming` into an ordered view
pub fn merge_into(entries: &mut Vec<ViewEntry>, incoming: ViewEntry, window: Duration) -> MergeOutcome {
    let Some(idx) = entries
        .iter()
        .position(|existing| same_logical(existing, &incoming, window))
    else {
        insert_ordered(entries, incoming);
        return MergeOutcome::Inserted;
    };

    let existing = entries.remove(idx);

    if existing.message.id == incoming.message.id
        && incoming.message.sender_role == Role::Assistant
    {
        let (merged, outcome) = merge_stream_update(existing, incoming);
        insert_ordered(entries, merged);
        return outcome;
    }

    if existing.source == Source::Store {
        entries.insert(idx, existing);
        return MergeOutcome::Duplicate;
    }
    if incoming.source == Source::Local && existing.source == Source::Transport {
        // Our own echo arrived first; keep it and start tracking delivery
        let mut kept = existing;
        kept.delivery = kept.delivery.or(incoming.delivery);
        entries.insert(idx, kept);
        return MergeOutcome::Duplicate;
    }

    let mut replacement = incoming;
    replacement.arrival = existing.arrival;
    replacement.delivery = match (existing.delivery, replacement.source) {
        (Some(_), Source::Store) => Some(Delivery::Confirmed),
        (Some(state), _) => Some(state),
        (None, _) => replacement.delivery,
    };
    insert_ordered(entries, replacement);
    MergeOutcome::Replaced
}

/// Latest non-empty text wins for a streaming assistant message
fn merge_stream_update(existing: ViewEntry, incoming: ViewEntry) -> (ViewEntry, MergeOutcome) {
    let stale_cursor = match (existing.cursor, incoming.cursor) {
        (Some(have), Some(got)) => got <= have,
        _ => false,
    };
    // Streamed text only grows; a strict prefix of what we show is old
    let stale_prefix = existing.message.text.len() > incoming.message.text.len()
        && existing.message.text.starts_with(&incoming.message.text);

    if incoming.message.text.is_empty() || stale_cursor {
        return (existing, MergeOutcome::Duplicate);
    }
    if incoming.source != Source::Store
        && (stale_prefix || incoming.message.text == existing.message.text)
    {
        return (existing, MergeOutcome::Duplicate);
    }

    let mut merged = existing;
    if !stale_prefix {
        merged.message.text = incoming.message.text;
    }
    if incoming.source == Source::Store {
        merged.source = Source::Store;
        merged.cursor = incoming.cursor;
        merged.message.created_at = incoming.message.created_at;
        if merged.delivery.is_some() {
            merged.delivery = Some(Delivery::Confirmed);
        }
    }
    (merged, MergeOutcome::Merged)
}

/// Insert by `(createdAt, store cursor, arrival)`; entries not yet in the
/// store sort after stored ones with the same timestamp.
pub fn insert_ordered(entries: &mut Vec<ViewEntry>, entry: ViewEntry) {
    let key = entry.order_key();
    let at = entries.partition_point(|e| e.order_key().cmp(&key) != Ordering::Greater);
    entries.insert(at, entry);
}

/// Functional form of [`merge_into`]: returns whether `incoming` was a new
/// logical message, plus the merged list.
pub fn dedup(existing: &[ViewEntry], incoming: ViewEntry, window: Duration) -> (bool, Vec<ViewEntry>) {
    let mut merged = existing.to_vec();
    let outcome = merge_into(&mut merged, incoming, window);
    (outcome == MergeOutcome::Inserted, merged)
}
