//! Process-wide connection registry: every live socket, who is online,
//! and which sockets subscribe to which rooms.
//!
//! All three maps sit behind one mutex so connect, join, and disconnect
//! can never observe each other half-applied. The lock is never held
//! across an await; deliveries are non-blocking channel sends, so a
//! stalled client cannot stall a broadcast.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::ws::Message;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::event::ServerEvent;

/// Outbound half of one socket. Cloned wherever something needs to push
/// frames to that client; a send to a closed writer just drops the frame.
pub type ConnectionHandle = mpsc::UnboundedSender<Message>;

pub type ConnId = Uuid;

#[derive(Default)]
struct Inner {
    /// Every open socket, identified or not.
    sessions: HashMap<ConnId, ConnectionHandle>,
    /// user id -> the connection that most recently announced it online.
    online: HashMap<i64, ConnId>,
    /// room key -> subscribed connections.
    rooms: HashMap<String, HashSet<ConnId>>,
    /// reverse index so disconnect can clear subscriptions in one step.
    joined: HashMap<ConnId, HashSet<String>>,
}

#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<Inner>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly opened socket.
    pub fn register(&self, conn_id: ConnId, handle: ConnectionHandle) {
        self.lock().sessions.insert(conn_id, handle);
    }

    /// Mark `user_id` online on `conn_id` and tell every connected
    /// socket. A repeat announce replaces the previous mapping (last
    /// writer wins); the replaced socket is left open.
    pub fn announce_online(&self, user_id: i64, conn_id: ConnId) {
        let msg = ServerEvent::UserStatusChanged {
            user_id,
            is_online: true,
        }
        .to_message();

        let mut inner = self.lock();
        inner.online.insert(user_id, conn_id);
        fan_out(inner.sessions.values(), &msg);
        tracing::info!(user_id, %conn_id, "user online");
    }

    /// Subscribe a socket to a room for the rest of its lifetime. There
    /// is no unjoin; membership ends with the connection.
    pub fn join_room(&self, room: &str, conn_id: ConnId) {
        let mut inner = self.lock();
        inner
            .rooms
            .entry(room.to_owned())
            .or_default()
            .insert(conn_id);
        inner
            .joined
            .entry(conn_id)
            .or_default()
            .insert(room.to_owned());
    }

    pub fn is_joined(&self, room: &str, conn_id: ConnId) -> bool {
        self.lock()
            .joined
            .get(&conn_id)
            .is_some_and(|rooms| rooms.contains(room))
    }

    /// Deliver an event to every socket subscribed to `room`.
    pub fn broadcast_room(&self, room: &str, event: &ServerEvent) {
        self.broadcast_room_inner(room, None, event);
    }

    /// Same, but skipping one socket: the typing relay never echoes a
    /// signal back to its own sender.
    pub fn broadcast_room_except(&self, room: &str, skip: ConnId, event: &ServerEvent) {
        self.broadcast_room_inner(room, Some(skip), event);
    }

    fn broadcast_room_inner(&self, room: &str, skip: Option<ConnId>, event: &ServerEvent) {
        let msg = event.to_message();
        let inner = self.lock();
        let Some(members) = inner.rooms.get(room) else {
            return;
        };
        for conn_id in members {
            if Some(*conn_id) == skip {
                continue;
            }
            if let Some(handle) = inner.sessions.get(conn_id) {
                if handle.send(msg.clone()).is_err() {
                    tracing::debug!(%conn_id, room, "dropping frame for closed socket");
                }
            }
        }
    }

    /// Tear down one socket: forget it, drop its room subscriptions, and
    /// if it still owns a presence entry, broadcast that user offline.
    /// A socket that never announced (or whose entry was already taken
    /// over by a later announce) produces no offline broadcast.
    pub fn disconnect(&self, conn_id: ConnId) {
        let mut inner = self.lock();
        inner.sessions.remove(&conn_id);

        if let Some(rooms) = inner.joined.remove(&conn_id) {
            for room in rooms {
                let now_empty = inner
                    .rooms
                    .get_mut(&room)
                    .map(|members| {
                        members.remove(&conn_id);
                        members.is_empty()
                    })
                    .unwrap_or(false);
                if now_empty {
                    inner.rooms.remove(&room);
                }
            }
        }

        let owned_user = inner
            .online
            .iter()
            .find(|(_, owner)| **owner == conn_id)
            .map(|(user_id, _)| *user_id);
        if let Some(user_id) = owned_user {
            inner.online.remove(&user_id);
            let msg = ServerEvent::UserStatusChanged {
                user_id,
                is_online: false,
            }
            .to_message();
            fan_out(inner.sessions.values(), &msg);
            tracing::info!(user_id, %conn_id, "user offline");
        }
    }

    /// Current set of online users, for the polling endpoint.
    pub fn snapshot(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.lock().online.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // a panic while holding this lock leaves the maps intact, so
        // recover the guard rather than poisoning every later caller
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn fan_out<'a>(handles: impl Iterator<Item = &'a ConnectionHandle>, msg: &Message) {
    for handle in handles {
        let _ = handle.send(msg.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn open_socket(registry: &Registry) -> (ConnId, mpsc::UnboundedReceiver<Message>) {
        let conn_id = Uuid::now_v7();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(conn_id, tx);
        (conn_id, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<Value> {
        let mut events = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            let Message::Text(text) = msg else {
                panic!("expected a text frame");
            };
            events.push(serde_json::from_str(&text).unwrap());
        }
        events
    }

    #[test]
    fn announce_broadcasts_online_to_every_session() {
        let registry = Registry::new();
        let (conn, mut rx) = open_socket(&registry);
        let (_observer, mut observer_rx) = open_socket(&registry);

        registry.announce_online(7, conn);

        for events in [drain(&mut rx), drain(&mut observer_rx)] {
            assert_eq!(events.len(), 1);
            assert_eq!(events[0]["type"], "user_status_changed");
            assert_eq!(events[0]["user_id"], 7);
            assert_eq!(events[0]["is_online"], true);
        }
        assert_eq!(registry.snapshot(), vec![7]);
    }

    #[test]
    fn at_most_one_entry_per_user() {
        let registry = Registry::new();
        let (first, _rx1) = open_socket(&registry);
        let (second, _rx2) = open_socket(&registry);

        registry.announce_online(7, first);
        registry.announce_online(7, second);
        registry.announce_online(9, first);

        assert_eq!(registry.snapshot(), vec![7, 9]);
    }

    #[test]
    fn disconnect_cleans_presence_and_broadcasts_offline_once() {
        let registry = Registry::new();
        let (conn, _rx) = open_socket(&registry);
        let (_observer, mut observer_rx) = open_socket(&registry);

        registry.announce_online(7, conn);
        registry.disconnect(conn);

        assert!(registry.snapshot().is_empty());
        let events = drain(&mut observer_rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["is_online"], true);
        assert_eq!(events[1]["is_online"], false);
        assert_eq!(events[1]["user_id"], 7);
    }

    #[test]
    fn unannounced_disconnect_is_silent() {
        let registry = Registry::new();
        let (conn, _rx) = open_socket(&registry);
        let (_observer, mut observer_rx) = open_socket(&registry);

        registry.disconnect(conn);

        assert!(drain(&mut observer_rx).is_empty());
    }

    #[test]
    fn replaced_connection_does_not_broadcast_offline() {
        // two tabs announce the same user; closing the older tab must not
        // flip the user offline while the newer one is still connected
        let registry = Registry::new();
        let (first, _rx1) = open_socket(&registry);
        let (second, _rx2) = open_socket(&registry);
        let (_observer, mut observer_rx) = open_socket(&registry);

        registry.announce_online(7, first);
        registry.announce_online(7, second);
        drain(&mut observer_rx);

        registry.disconnect(first);
        assert!(drain(&mut observer_rx).is_empty());
        assert_eq!(registry.snapshot(), vec![7]);

        registry.disconnect(second);
        let events = drain(&mut observer_rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["is_online"], false);
    }

    #[test]
    fn room_broadcast_reaches_only_subscribers() {
        let registry = Registry::new();
        let (alice, mut alice_rx) = open_socket(&registry);
        let (bob, mut bob_rx) = open_socket(&registry);
        let (_bystander, mut bystander_rx) = open_socket(&registry);

        registry.join_room("room_7_42", alice);
        registry.join_room("room_7_42", bob);

        registry.broadcast_room("room_7_42", &ServerEvent::UserTyping { user_id: 7 });

        assert_eq!(drain(&mut alice_rx).len(), 1);
        assert_eq!(drain(&mut bob_rx).len(), 1);
        assert!(drain(&mut bystander_rx).is_empty());
    }

    #[test]
    fn broadcast_except_skips_the_sender() {
        let registry = Registry::new();
        let (alice, mut alice_rx) = open_socket(&registry);
        let (bob, mut bob_rx) = open_socket(&registry);

        registry.join_room("room_7_42", alice);
        registry.join_room("room_7_42", bob);

        registry.broadcast_room_except("room_7_42", alice, &ServerEvent::UserTyping { user_id: 7 });

        assert!(drain(&mut alice_rx).is_empty());
        let events = drain(&mut bob_rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "user_typing");
    }

    #[test]
    fn disconnect_clears_room_membership() {
        let registry = Registry::new();
        let (alice, _alice_rx) = open_socket(&registry);
        let (bob, mut bob_rx) = open_socket(&registry);

        registry.join_room("room_7_42", alice);
        registry.join_room("room_7_42", bob);
        registry.disconnect(bob);

        assert!(!registry.is_joined("room_7_42", bob));
        registry.broadcast_room("room_7_42", &ServerEvent::UserTyping { user_id: 7 });
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[test]
    fn dead_subscriber_does_not_break_the_broadcast() {
        let registry = Registry::new();
        let (alice, rx) = open_socket(&registry);
        let (bob, mut bob_rx) = open_socket(&registry);

        registry.join_room("room_7_42", alice);
        registry.join_room("room_7_42", bob);
        drop(rx); // alice's writer is gone but she never disconnected cleanly

        registry.broadcast_room("room_7_42", &ServerEvent::UserTyping { user_id: 42 });
        assert_eq!(drain(&mut bob_rx).len(), 1);
    }
}
