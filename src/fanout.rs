//! Signal Fanout
//!
//! Pushes side-channel signals: typing indicators, read receipts, and
//! presence changes. Everything here is fire-and-forget toward offline
//! targets; only the read-receipt path touches durable state.

use std::sync::Arc;

use crate::messages::MessageStore;
use crate::presence::{OutboundFrame, PresenceRegistry};
use crate::protocol::{
    self, EventPayload, MessagesRead, StopTypingIndicator, TypingIndicator, UserPresence,
};
use tracing::warn;

/// Fans signals out to the connections that should see them.
pub struct SignalFanout {
    registry: Arc<PresenceRegistry>,
    store: Arc<dyn MessageStore>,
}

impl SignalFanout {
    pub fn new(registry: Arc<PresenceRegistry>, store: Arc<dyn MessageStore>) -> Self {
        SignalFanout { registry, store }
    }

    /// Notifies the recipient that the sender started typing. Dropped
    /// silently if the recipient is offline.
    pub fn typing(&self, sender_id: &str, sender_name: &str, recipient_id: &str) {
        self.push_to(
            recipient_id,
            EventPayload::TypingIndicator(TypingIndicator {
                sender_id: sender_id.to_string(),
                sender_name: sender_name.to_string(),
            }),
        );
    }

    /// Notifies the recipient that the sender stopped typing.
    pub fn stop_typing(&self, sender_id: &str, recipient_id: &str) {
        self.push_to(
            recipient_id,
            EventPayload::StopTypingIndicator(StopTypingIndicator {
                sender_id: sender_id.to_string(),
            }),
        );
    }

    /// Records the reader's read markers, then pushes a receipt to the
    /// original sender if anything actually changed. Marking the same
    /// messages twice produces no second receipt.
    pub fn mark_read(&self, reader_id: &str, message_ids: &[String], original_sender: &str) {
        let marked = self.store.mark_read(message_ids, reader_id);
        if marked == 0 {
            return;
        }
        self.push_to(
            original_sender,
            EventPayload::MessagesRead(MessagesRead {
                message_ids: message_ids.to_vec(),
                read_by: reader_id.to_string(),
            }),
        );
    }

    /// Announces a presence change to every other active connection.
    ///
    /// One frame per online user; fine at the current scale, and isolated
    /// behind the registry's broadcast so a subscription model can replace
    /// it without touching callers.
    pub fn broadcast_presence(&self, user_id: &str, online: bool) {
        let presence = UserPresence {
            user_id: user_id.to_string(),
        };
        let payload = if online {
            EventPayload::UserOnline(presence)
        } else {
            EventPayload::UserOffline(presence)
        };
        let env = protocol::envelope(payload);
        match protocol::encode_message(&env) {
            Ok(data) => self.registry.broadcast_except(user_id, &OutboundFrame { data }),
            Err(e) => warn!("Failed to encode presence frame: {e}"),
        }
    }

    fn push_to(&self, user_id: &str, payload: EventPayload) -> bool {
        let env = protocol::envelope(payload);
        match protocol::encode_message(&env) {
            Ok(data) => self.registry.push(user_id, OutboundFrame { data }),
            Err(e) => {
                warn!("Failed to encode outbound frame: {e}");
                false
            }
        }
    }
}
