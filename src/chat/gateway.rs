//! Message send orchestration and the typing relay.

use std::time::Duration;

use tokio::time::timeout;

use super::event::{AckStatus, ServerEvent};
use super::registry::ConnId;
use super::room;
use super::ws::Session;
use crate::{store, AppState};

/// Upper bound on the persistence step of one send; past this the caller
/// gets a failure ack instead of a hung socket.
const PERSIST_TIMEOUT: Duration = Duration::from_secs(5);

/// Validate, persist, enrich, broadcast, then acknowledge.
/// Nothing is broadcast unless the row committed, and a persistence
/// fault surfaces only as a negative ack to the calling socket.
pub(crate) async fn send_message(
    state: &AppState,
    session: &Session,
    sender_id: i64,
    receiver_id: i64,
    message: String,
    client_message_id: Option<String>,
) {
    let content = message.trim();
    if content.is_empty() {
        nack(session, client_message_id, "message text is required");
        return;
    }

    let room = room::room_key(sender_id, receiver_id);
    if !state.registry.is_joined(&room, session.conn_id) {
        nack(session, client_message_id, "join the conversation before sending");
        return;
    }

    // no registry lock is held while the database call is in flight
    let stored = match timeout(
        PERSIST_TIMEOUT,
        store::insert_message(&state.db_pool, sender_id, receiver_id, content),
    )
    .await
    {
        Ok(Ok(stored)) => stored,
        Ok(Err(err)) => {
            tracing::warn!(sender_id, receiver_id, %err, "message insert failed");
            nack(session, client_message_id, "message could not be saved");
            return;
        }
        Err(_) => {
            tracing::warn!(sender_id, receiver_id, "message insert timed out");
            nack(session, client_message_id, "message could not be saved");
            return;
        }
    };

    // recipients see the sender as of the moment of sending
    let (sender_username, sender_pfp) = store::sender_profile(&state.db_pool, sender_id).await;

    let enriched = ServerEvent::ReceiveMessage {
        sender_id,
        receiver_id,
        content: stored.content.clone(),
        message: stored.content,
        client_message_id: client_message_id.clone(),
        sender_username,
        sender_pfp,
        message_id: stored.message_id,
        created_at: stored.created_at,
    };
    state.registry.broadcast_room(&room, &enriched);

    let ack = ServerEvent::Ack {
        status: AckStatus::Ok,
        message_id: Some(stored.message_id),
        client_message_id,
        error: None,
    };
    let _ = session.handle.send(ack.to_message());
}

fn nack(session: &Session, client_message_id: Option<String>, reason: &str) {
    let ack = ServerEvent::Ack {
        status: AckStatus::Error,
        message_id: None,
        client_message_id,
        error: Some(reason.to_owned()),
    };
    let _ = session.handle.send(ack.to_message());
}

/// Fan a typing signal out to the rest of the room, sender excluded.
/// Ephemeral: no persistence, no ack, and nothing on this path can fail
/// the calling session.
pub(crate) fn relay_typing(
    state: &AppState,
    conn_id: ConnId,
    user_id: i64,
    receiver_id: i64,
    stopped: bool,
) {
    let room = room::room_key(user_id, receiver_id);
    let event = if stopped {
        ServerEvent::UserStoppedTyping { user_id }
    } else {
        ServerEvent::UserTyping { user_id }
    };
    state.registry.broadcast_room_except(&room, conn_id, &event);
}
