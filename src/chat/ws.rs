//! One task pair per live socket: a reader that dispatches events in
//! arrival order and a writer that drains the connection's outbox.

use axum::{
    debug_handler,
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::event::ClientEvent;
use super::registry::{ConnId, ConnectionHandle};
use super::{gateway, room};
use crate::AppState;

/// One live socket: its connection id, its outbound handle, and the
/// identity it has announced, if any.
pub(crate) struct Session {
    pub conn_id: ConnId,
    pub handle: ConnectionHandle,
    pub user_id: Option<i64>,
}

#[debug_handler]
pub(crate) async fn chat_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = Uuid::now_v7();
    let (handle, outbox) = mpsc::unbounded_channel::<Message>();
    state.registry.register(conn_id, handle.clone());
    tracing::info!(%conn_id, "socket connected");

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, outbox));

    let mut session = Session {
        conn_id,
        handle,
        user_id: None,
    };
    read_loop(&state, &mut session, stream).await;

    // transport closed: cleanup runs whatever state the session reached
    state.registry.disconnect(conn_id);
    writer.abort();
    tracing::info!(%conn_id, user_id = ?session.user_id, "socket disconnected");
}

async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut outbox: mpsc::UnboundedReceiver<Message>) {
    while let Some(msg) = outbox.recv().await {
        if sink.send(msg).await.is_err() {
            break;
        }
    }
}

/// Events are dispatched one at a time, so two sends from the same
/// client can never race each other into the store.
async fn read_loop(state: &AppState, session: &mut Session, mut stream: SplitStream<WebSocket>) {
    while let Some(Ok(msg)) = stream.next().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        match serde_json::from_str::<ClientEvent>(&text) {
            Ok(event) => dispatch(state, session, event).await,
            Err(err) => {
                // a bad frame costs the client one event, not the socket
                tracing::debug!(conn_id = %session.conn_id, %err, "unreadable chat event");
            }
        }
    }
}

async fn dispatch(state: &AppState, session: &mut Session, event: ClientEvent) {
    match event {
        ClientEvent::UserOnline { user_id } => {
            session.user_id = Some(user_id);
            state.registry.announce_online(user_id, session.conn_id);
        }
        ClientEvent::Join { user1, user2 } => {
            session.user_id = Some(user1);
            let room = room::room_key(user1, user2);
            state.registry.join_room(&room, session.conn_id);
            // membership first: anyone reacting to the presence
            // broadcast can already reach this session in the room
            state.registry.announce_online(user1, session.conn_id);
            tracing::debug!(conn_id = %session.conn_id, room, "joined room");
        }
        ClientEvent::SendMessage {
            sender_id,
            receiver_id,
            message,
            client_message_id,
        } => {
            gateway::send_message(state, session, sender_id, receiver_id, message, client_message_id)
                .await;
        }
        ClientEvent::Typing { user_id, receiver_id } => {
            gateway::relay_typing(state, session.conn_id, user_id, receiver_id, false);
        }
        ClientEvent::StopTyping { user_id, receiver_id } => {
            gateway::relay_typing(state, session.conn_id, user_id, receiver_id, true);
        }
    }
}
