pub mod actor;
pub mod broadcast;
pub mod events;
pub mod handler;
pub mod protocol;

use dashmap::DashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::auth::Role;

/// Type alias for the sender half of a WebSocket connection's channel.
/// Other parts of the system can clone this to push messages to a specific client.
pub type ConnectionSender = mpsc::UnboundedSender<axum::extract::ws::Message>;

pub type ConnectionId = Uuid;

/// Named fan-out group. Membership is per connection and is never carried
/// across a reconnect: clients re-join after every `connected`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Room {
    /// Admin consoles (`joinAdminRoom`).
    Admins,
    /// Participants of one support chat (`joinRoom`).
    Session(String),
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admins => f.write_str("admins"),
            Self::Session(id) => write!(f, "chat:{}", id),
        }
    }
}

/// One live socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user_id: String,
    pub role: Role,
    pub sender: ConnectionSender,
}

/// Connection table and room membership. One instance lives in `AppState`
/// for the lifetime of the server; it is passed explicitly, never global.
///
/// A user can have multiple concurrent connections (multiple devices/tabs).
#[derive(Clone, Default)]
pub struct Hub {
    connections: Arc<DashMap<ConnectionId, ConnectionHandle>>,
    by_user: Arc<DashMap<String, Vec<ConnectionId>>>,
    rooms: Arc<DashMap<Room, HashSet<ConnectionId>>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Returns true if it is the user's first live one.
    pub fn register(&self, handle: ConnectionHandle) -> bool {
        let id = handle.id;
        let user_id = handle.user_id.clone();
        self.connections.insert(id, handle);

        let mut conns = self.by_user.entry(user_id.clone()).or_default();
        conns.push(id);
        let first = conns.len() == 1;
        drop(conns);

        tracing::debug!(
            user_id = %user_id,
            connection_id = %id,
            first = first,
            "Connection registered"
        );
        first
    }

    /// Remove a connection and all of its room memberships.
    /// Returns the handle and whether it was the user's last live connection.
    pub fn unregister(&self, id: ConnectionId) -> Option<(ConnectionHandle, bool)> {
        let (_, handle) = self.connections.remove(&id)?;

        for mut members in self.rooms.iter_mut() {
            members.value_mut().remove(&id);
        }
        self.rooms.retain(|_, members| !members.is_empty());

        let mut last = true;
        if let Some(mut conns) = self.by_user.get_mut(&handle.user_id) {
            conns.retain(|c| *c != id);
            last = conns.is_empty();
        }
        if last {
            self.by_user.remove(&handle.user_id);
        }

        tracing::debug!(
            user_id = %handle.user_id,
            connection_id = %id,
            last = last,
            "Connection unregistered"
        );
        Some((handle, last))
    }

    pub fn join(&self, id: ConnectionId, room: Room) {
        if !self.connections.contains_key(&id) {
            return;
        }
        tracing::debug!(connection_id = %id, room = %room, "Joined room");
        self.rooms.entry(room).or_default().insert(id);
    }

    pub fn leave(&self, id: ConnectionId, room: &Room) {
        let mut empty = false;
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(&id);
            empty = members.is_empty();
        }
        if empty {
            self.rooms.remove_if(room, |_, members| members.is_empty());
        }
    }

    pub fn is_member(&self, id: ConnectionId, room: &Room) -> bool {
        self.rooms
            .get(room)
            .map(|members| members.contains(&id))
            .unwrap_or(false)
    }

    pub fn members(&self, room: &Room) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn connections_of(&self, user_id: &str) -> Vec<ConnectionId> {
        self.by_user
            .get(user_id)
            .map(|conns| conns.clone())
            .unwrap_or_default()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.by_user.contains_key(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Inbox = mpsc::UnboundedReceiver<axum::extract::ws::Message>;

    fn handle(user_id: &str, role: Role) -> (ConnectionHandle, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ConnectionHandle {
                id: Uuid::new_v4(),
                user_id: user_id.to_string(),
                role,
                sender: tx,
            },
            rx,
        )
    }

    #[test]
    fn last_connection_is_reported_once() {
        let hub = Hub::new();
        let (a, _rx_a) = handle("adm-1", Role::Admin);
        let (b, _rx_b) = handle("adm-1", Role::Admin);
        let (a_id, b_id) = (a.id, b.id);

        assert!(hub.register(a));
        assert!(!hub.register(b));

        let (_, last) = hub.unregister(a_id).unwrap();
        assert!(!last);
        assert!(hub.is_online("adm-1"));

        let (_, last) = hub.unregister(b_id).unwrap();
        assert!(last);
        assert!(!hub.is_online("adm-1"));
        assert!(hub.unregister(b_id).is_none());
    }

    #[test]
    fn rooms_are_dropped_on_unregister() {
        let hub = Hub::new();
        let (a, _rx) = handle("cust-1", Role::Customer);
        let id = a.id;
        hub.register(a);
        hub.join(id, Room::Session("s-1".into()));
        assert!(hub.is_member(id, &Room::Session("s-1".into())));

        hub.unregister(id);
        assert!(hub.members(&Room::Session("s-1".into())).is_empty());
    }

    #[test]
    fn unknown_connection_cannot_join() {
        let hub = Hub::new();
        let id = Uuid::new_v4();
        hub.join(id, Room::Admins);
        assert!(hub.members(&Room::Admins).is_empty());
    }

    #[test]
    fn room_names() {
        assert_eq!(Room::Admins.to_string(), "admins");
        assert_eq!(Room::Session("abc".into()).to_string(), "chat:abc");
    }
}
