//! Message Relay
//!
//! Validates, persists, and delivers direct messages. Persistence always
//! happens before the live push, so a recipient that misses the push finds
//! the message in the log when it next syncs. Delivery to an offline
//! recipient is not an error; the message simply waits in the log.

use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use crate::messages::{MessageStore, StoredMessage, MAX_CONTENT_CHARS};
use crate::presence::{OutboundFrame, PresenceRegistry};
use crate::protocol::{
    self, EventPayload, MessageDeleted, MessageView, SendMessage, UserSummary,
};
use crate::users::UserDirectory;

/// Relay failures reported back to the originating connection.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Message content is empty")]
    EmptyContent,
    #[error("Message exceeds {MAX_CONTENT_CHARS} characters")]
    ContentTooLong,
    #[error("Unknown recipient")]
    UnknownRecipient,
    #[error("Sender record missing")]
    UnknownSender,
    #[error("Message not found")]
    NotFound,
    #[error("Only the sender can delete a message")]
    NotPermitted,
    #[error("Failed to persist message")]
    Storage,
}

impl RelayError {
    /// Machine-checkable code carried alongside the human-readable text.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::EmptyContent => "empty-content",
            RelayError::ContentTooLong => "content-too-long",
            RelayError::UnknownRecipient => "recipient-not-found",
            RelayError::UnknownSender => "sender-not-found",
            RelayError::NotFound => "message-not-found",
            RelayError::NotPermitted => "not-permitted",
            RelayError::Storage => "persistence-failed",
        }
    }
}

/// Result of a successful send.
pub struct SendOutcome {
    /// Expanded message for the sender's echo.
    pub view: MessageView,
    /// Whether the live push reached the recipient's connection.
    pub delivered: bool,
}

/// Relays direct messages between users.
pub struct MessageRelay {
    registry: Arc<PresenceRegistry>,
    users: Arc<dyn UserDirectory>,
    store: Arc<dyn MessageStore>,
}

impl MessageRelay {
    pub fn new(
        registry: Arc<PresenceRegistry>,
        users: Arc<dyn UserDirectory>,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        MessageRelay {
            registry,
            users,
            store,
        }
    }

    /// Validates, persists, and pushes a message. Returns the expanded view
    /// for the sender's echo and whether the recipient got a live push.
    pub fn send(&self, sender_id: &str, req: SendMessage) -> Result<SendOutcome, RelayError> {
        let content = req.content.trim();
        if content.is_empty() {
            return Err(RelayError::EmptyContent);
        }
        if content.chars().count() > MAX_CONTENT_CHARS {
            return Err(RelayError::ContentTooLong);
        }

        let recipient = self
            .users
            .get(&req.recipient_id)
            .ok_or(RelayError::UnknownRecipient)?;
        let sender = self.users.get(sender_id).ok_or(RelayError::UnknownSender)?;

        let msg = StoredMessage::new(sender_id, &req.recipient_id, content, req.kind);
        if !self.store.append(msg.clone()) {
            return Err(RelayError::Storage);
        }

        let view = MessageView::expand(
            &msg,
            UserSummary::from_record(&sender),
            UserSummary::from_record(&recipient),
        );

        let delivered = self.push_to(
            &req.recipient_id,
            EventPayload::ReceiveMessage(view.clone()),
        );

        Ok(SendOutcome { view, delivered })
    }

    /// Tombstones a message on the sender's request and notifies the
    /// recipient if online.
    pub fn delete(&self, requester_id: &str, message_id: &str) -> Result<(), RelayError> {
        let msg = self.store.get(message_id).ok_or(RelayError::NotFound)?;
        if msg.sender_id != requester_id {
            return Err(RelayError::NotPermitted);
        }
        if !self.store.tombstone(message_id, requester_id) {
            return Err(RelayError::NotFound);
        }

        self.push_to(
            &msg.recipient_id,
            EventPayload::MessageDeleted(MessageDeleted {
                message_id: message_id.to_string(),
            }),
        );
        Ok(())
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
