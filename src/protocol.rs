//! Wire Protocol
//!
//! Frames are a 4-byte big-endian length prefix followed by a JSON envelope.
//! The envelope payload is internally tagged so new event types can be added
//! without breaking older clients (unknown types decode to `Unknown`).

use serde::{Deserialize, Serialize};

use crate::messages::{MessageKind, StoredMessage};
use crate::users::UserRecord;

pub const PROTOCOL_VERSION: u8 = 1;
pub const FRAME_HEADER_SIZE: usize = 4;

/// Top-level wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u8,
    pub message_id: String,
    pub timestamp: u64,
    pub payload: EventPayload,
}

/// All inbound (client → server) and outbound (server → client) events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    // Handshake
    Connect(Connect),
    ConnectAck(ConnectAck),
    // Messaging
    SendMessage(SendMessage),
    ReceiveMessage(MessageView),
    MessageSent(MessageView),
    DeleteMessage(DeleteMessage),
    MessageDeleted(MessageDeleted),
    // Ephemeral signals
    Typing(Typing),
    StopTyping(Typing),
    TypingIndicator(TypingIndicator),
    StopTypingIndicator(StopTypingIndicator),
    // Read receipts
    MarkAsRead(MarkAsRead),
    MessagesRead(MessagesRead),
    // Presence
    OnlineUsers(OnlineUsers),
    UserOnline(UserPresence),
    UserOffline(UserPresence),
    GetUserStatus(GetUserStatus),
    UserStatus(UserStatus),
    // Scoped failures
    Error(ErrorEvent),
    #[serde(other)]
    Unknown,
}

/// Opening frame: carries the bearer token. Must be the first frame on the
/// connection; anything else is refused before any registration happens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connect {
    pub token: String,
}

/// Server response to a successful handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectAck {
    pub protocol_version: u8,
    pub server_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessage {
    pub recipient_id: String,
    pub content: String,
    #[serde(default)]
    pub kind: MessageKind,
}

/// A message with sender and recipient expanded to display info, as pushed
/// to live connections and echoed back to the sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageView {
    pub id: String,
    pub sender: UserSummary,
    pub recipient: UserSummary,
    pub content: String,
    pub kind: MessageKind,
    pub read_by: Vec<String>,
    pub created_at: u64,
}

/// Public slice of a user record attached to delivered messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: String,
    pub username: String,
    pub email: String,
}

impl UserSummary {
    pub fn from_record(record: &UserRecord) -> Self {
        UserSummary {
            id: record.id.clone(),
            username: record.username.clone(),
            email: record.email.clone(),
        }
    }
}

impl MessageView {
    /// Expands a stored message with the sender's and recipient's display info.
    pub fn expand(msg: &StoredMessage, sender: UserSummary, recipient: UserSummary) -> Self {
        MessageView {
            id: msg.id.clone(),
            sender,
            recipient,
            content: msg.content.clone(),
            kind: msg.kind,
            read_by: msg.read_by.clone(),
            created_at: msg.created_at_secs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteMessage {
    pub message_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDeleted {
    pub message_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Typing {
    pub recipient_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypingIndicator {
    pub sender_id: String,
    pub sender_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopTypingIndicator {
    pub sender_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkAsRead {
    pub message_ids: Vec<String>,
    /// The original sender, who gets the read receipt if online.
    pub sender_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRead {
    pub message_ids: Vec<String>,
    pub read_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlineUsers {
    pub user_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPresence {
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetUserStatus {
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserStatus {
    pub user_id: String,
    pub online: bool,
}

/// Scoped error reported back to the originating connection only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Current Unix time in seconds.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Wraps a payload in a fresh envelope.
pub fn envelope(payload: EventPayload) -> Envelope {
    Envelope {
        version: PROTOCOL_VERSION,
        message_id: uuid::Uuid::new_v4().to_string(),
        timestamp: now_secs(),
        payload,
    }
}

/// Builds an error envelope with an optional machine-checkable code.
pub fn error_event(message: impl Into<String>, code: Option<&str>) -> Envelope {
    envelope(EventPayload::Error(ErrorEvent {
        message: message.into(),
        code: code.map(str::to_string),
    }))
}

/// Decodes a frame (length prefix + JSON envelope).
pub fn decode_message(data: &[u8]) -> Result<Envelope, String> {
    if data.len() < FRAME_HEADER_SIZE {
        return Err("Frame too short".to_string());
    }

    let json = &data[FRAME_HEADER_SIZE..];
    serde_json::from_slice(json).map_err(|e| e.to_string())
}

/// Encodes an envelope into a frame (length prefix + JSON).
pub fn encode_message(envelope: &Envelope) -> Result<Vec<u8>, String> {
    let json = serde_json::to_vec(envelope).map_err(|e| e.to_string())?;
    let len = json.len() as u32;

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + json.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&json);

    Ok(frame)
}
