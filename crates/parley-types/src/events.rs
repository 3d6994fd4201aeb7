use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MessageKind, MessagePayload, PresenceStatus};

/// Commands sent FROM client TO server over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum ClientCommand {
    /// Authenticate the connection. Must be the first command.
    Authenticate { token: String },

    /// Subscribe to a chat's broadcast group (participant-checked).
    JoinChat { chat_id: Uuid },

    /// Unsubscribe from a chat's broadcast group. Always permitted;
    /// does not touch persistent participant state.
    LeaveChat { chat_id: Uuid },

    SendMessage {
        chat_id: Uuid,
        content: String,
        kind: MessageKind,
        reply_to: Option<i64>,
        /// Client correlation token for the optimistic local echo.
        temp_id: Option<String>,
    },

    EditMessage { message_id: i64, content: String },

    DeleteMessage { message_id: i64 },

    TypingStart { chat_id: Uuid },

    TypingStop { chat_id: Uuid },

    AddReaction { message_id: i64, emoji: String },

    RemoveReaction { message_id: i64, emoji: String },

    /// Advance this participant's read cursor to now.
    MarkRead { chat_id: Uuid },

    /// Manually set presence status (e.g. away with a custom text).
    SetStatus {
        status: PresenceStatus,
        status_text: Option<String>,
    },
}

/// Events sent FROM server TO client over the WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum ServerEvent {
    /// Handshake succeeded; the connection is registered.
    Authenticated { user_id: Uuid, username: String },

    /// Handshake failed; the connection will be closed.
    AuthError { reason: String },

    JoinedChat { chat_id: Uuid },

    LeftChat { chat_id: Uuid },

    /// Sent only to the originating connection when it supplied a
    /// `temp_id`, instead of a second `new_message` copy.
    MessageSent {
        temp_id: String,
        message: MessagePayload,
    },

    NewMessage { message: MessagePayload },

    MessageEdited { message: MessagePayload },

    MessageDeleted { message_id: i64, chat_id: Uuid },

    UserTyping {
        chat_id: Uuid,
        user_id: Uuid,
        username: String,
    },

    UserStoppedTyping { chat_id: Uuid, user_id: Uuid },

    ReactionAdded {
        message_id: i64,
        chat_id: Uuid,
        user_id: Uuid,
        emoji: String,
    },

    ReactionRemoved {
        message_id: i64,
        chat_id: Uuid,
        user_id: Uuid,
        emoji: String,
    },

    MessagesRead {
        chat_id: Uuid,
        user_id: Uuid,
        last_read_at: chrono::DateTime<chrono::Utc>,
    },

    UserStatusUpdate {
        user_id: Uuid,
        status: PresenceStatus,
        status_text: Option<String>,
        last_seen: Option<chrono::DateTime<chrono::Utc>>,
    },

    /// Operation failure, delivered to the initiator only.
    Error {
        code: ErrorCode,
        message: String,
        chat_id: Option<Uuid>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    AuthError,
    AccessDenied,
    NotFound,
    SendFailed,
    BadRequest,
}

impl ServerEvent {
    /// Returns the chat id if this event is scoped to a specific chat.
    /// Unscoped events are targeted (acks, errors, presence) and are
    /// delivered through per-connection channels instead of chat groups.
    pub fn chat_id(&self) -> Option<Uuid> {
        match self {
            Self::NewMessage { message } => Some(message.chat_id),
            Self::MessageEdited { message } => Some(message.chat_id),
            Self::MessageDeleted { chat_id, .. } => Some(*chat_id),
            Self::UserTyping { chat_id, .. } => Some(*chat_id),
            Self::UserStoppedTyping { chat_id, .. } => Some(*chat_id),
            Self::ReactionAdded { chat_id, .. } => Some(*chat_id),
            Self::ReactionRemoved { chat_id, .. } => Some(*chat_id),
            Self::MessagesRead { chat_id, .. } => Some(*chat_id),
            _ => None,
        }
    }
}
