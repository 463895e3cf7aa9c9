//! Wire envelope for the chat socket: JSON text frames tagged by `type`.

use axum::extract::ws::Message;
use serde::{Deserialize, Serialize};

/// Events arriving from a client socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    UserOnline {
        user_id: i64,
    },
    /// Subscribe to the conversation between `user1` and `user2`. Also
    /// announces `user1` online, so a client landing directly on a chat
    /// view shows up in the sidebar without a separate `user_online`.
    Join {
        user1: i64,
        user2: i64,
    },
    SendMessage {
        sender_id: i64,
        receiver_id: i64,
        message: String,
        #[serde(default)]
        client_message_id: Option<String>,
    },
    Typing {
        user_id: i64,
        receiver_id: i64,
    },
    StopTyping {
        user_id: i64,
        receiver_id: i64,
    },
}

/// Events the server pushes to client sockets.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    ReceiveMessage {
        sender_id: i64,
        receiver_id: i64,
        // same text under both names; both field names are live in
        // deployed clients
        content: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_message_id: Option<String>,
        sender_username: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sender_pfp: Option<String>,
        message_id: i64,
        created_at: String,
    },
    UserStatusChanged {
        user_id: i64,
        is_online: bool,
    },
    UserTyping {
        user_id: i64,
    },
    UserStoppedTyping {
        user_id: i64,
    },
    /// Synchronous answer to a `send_message`, distinct from the room
    /// broadcast: delivered only to the sending socket.
    Ack {
        status: AckStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_message_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Ok,
    Error,
}

impl ServerEvent {
    /// Encode into a websocket text frame. These enums hold plain data,
    /// so serialization is infallible.
    pub fn to_message(&self) -> Message {
        Message::Text(
            serde_json::to_string(self)
                .expect("server event serializes")
                .into(),
        )
    }
}
