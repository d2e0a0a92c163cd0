//! Channel routing
//!
//! A session lives on exactly one channel at a time. Switching tears the
//! connection down and re-opens it with the new channel in the handshake,
//! so nothing from the old conversation can bleed into the new view.

use relaydesk_shared::{Channel, ConversationId, Message};

use crate::error::ClientError;
use crate::session::Session;

impl Session {
    /// Move the session to `channel`. Routing to the current channel is a no-op.
    pub async fn route(&mut self, channel: Channel) -> Result<(), ClientError> {
        if channel == self.channel {
            tracing::debug!(channel = %channel, "Already on channel");
            return Ok(());
        }

        let from = self.conversation_id();
        self.detach().await;

        let to = ConversationId::for_subject(self.participant().subject_id, channel);
        {
            let mut sync = self.sync.lock().await;
            sync.clear(&from);
            // Re-subscribe from the beginning of the new conversation
            sync.clear(&to);
        }
        self.channel = channel;
        self.attach().await?;

        tracing::info!(
            from = %from,
            to = %to,
            "Session routed to new channel"
        );
        Ok(())
    }

    /// Stamp an outgoing message with the session's current channel
    pub(crate) fn stamp(&self, message: &mut Message) {
        if message.channel != self.channel || message.conversation_id != self.conversation_id() {
            message.channel = self.channel;
            message.conversation_id = self.conversation_id();
        }
    }
}
