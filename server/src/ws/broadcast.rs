use axum::extract::ws::{CloseFrame, Message};

use super::events::ServerEvent;
use super::{ConnectionId, Hub, Room};

/// Encode an event once as a JSON text frame.
pub fn encode_event(event: &ServerEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            tracing::warn!(event = event.name(), error = %e, "Failed to encode event");
            None
        }
    }
}

impl Hub {
    /// Send an event to every member of a room. Returns the number of
    /// connections the frame was queued on.
    pub fn publish(&self, room: &Room, event: &ServerEvent) -> usize {
        let Some(msg) = encode_event(event) else {
            return 0;
        };
        let sent = self.send_to_many(&self.members(room), &msg);
        tracing::debug!(room = %room, event = event.name(), sent = sent, "Published");
        sent
    }

    /// Send an event once to every connection in any of `rooms`.
    pub fn publish_many(&self, rooms: &[Room], event: &ServerEvent) -> usize {
        let Some(msg) = encode_event(event) else {
            return 0;
        };
        let mut targets: Vec<ConnectionId> =
            rooms.iter().flat_map(|room| self.members(room)).collect();
        targets.sort_unstable();
        targets.dedup();
        self.send_to_many(&targets, &msg)
    }

    /// Like `publish`, skipping one connection (usually the sender).
    pub fn publish_except(&self, room: &Room, except: ConnectionId, event: &ServerEvent) -> usize {
        let Some(msg) = encode_event(event) else {
            return 0;
        };
        let targets: Vec<ConnectionId> = self
            .members(room)
            .into_iter()
            .filter(|id| *id != except)
            .collect();
        self.send_to_many(&targets, &msg)
    }

    /// Send an event to a specific user (all their connections).
    pub fn send_to_user(&self, user_id: &str, event: &ServerEvent) -> usize {
        let Some(msg) = encode_event(event) else {
            return 0;
        };
        self.send_to_many(&self.connections_of(user_id), &msg)
    }

    /// Send an event to one connection.
    pub fn send_to_conn(&self, id: ConnectionId, event: &ServerEvent) -> bool {
        let Some(msg) = encode_event(event) else {
            return false;
        };
        self.send_to_many(&[id], &msg) == 1
    }

    /// Force-close all connections for a user.
    pub fn close_user(&self, user_id: &str, close_code: u16, reason: &str) {
        let frame = CloseFrame {
            code: close_code,
            reason: reason.to_string().into(),
        };
        for id in self.connections_of(user_id) {
            if let Some(handle) = self.connections.get(&id) {
                let _ = handle.sender.send(Message::Close(Some(frame.clone())));
            }
        }
    }

    fn send_to_many(&self, ids: &[ConnectionId], msg: &Message) -> usize {
        let mut sent = 0;
        for id in ids {
            if let Some(handle) = self.connections.get(id) {
                // A closed receiver means the writer task is gone; the actor
                // unregisters it shortly.
                if handle.sender.send(msg.clone()).is_ok() {
                    sent += 1;
                }
            }
        }
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::ws::events::{MessageEvent, ServerEvent};
    use crate::ws::ConnectionHandle;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn connect(hub: &Hub, user: &str) -> (ConnectionId, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        hub.register(ConnectionHandle {
            id,
            user_id: user.to_string(),
            role: Role::Driver,
            sender: tx,
        });
        (id, rx)
    }

    fn sample() -> ServerEvent {
        ServerEvent::DriverRegisterError(MessageEvent {
            message: "nope".into(),
        })
    }

    #[test]
    fn publish_reaches_only_room_members() {
        let hub = Hub::new();
        let (a, mut rx_a) = connect(&hub, "drv-a");
        let (_b, mut rx_b) = connect(&hub, "drv-b");
        hub.join(a, Room::Admins);

        assert_eq!(hub.publish(&Room::Admins, &sample()), 1);
        assert!(matches!(rx_a.try_recv(), Ok(Message::Text(_))));
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn send_to_user_reaches_every_tab() {
        let hub = Hub::new();
        let (_a1, mut rx1) = connect(&hub, "drv-a");
        let (_a2, mut rx2) = connect(&hub, "drv-a");
        assert_eq!(hub.send_to_user("drv-a", &sample()), 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn publish_many_delivers_once_per_connection() {
        let hub = Hub::new();
        let (a, mut rx_a) = connect(&hub, "adm-a");
        let room = Room::Session("s".into());
        hub.join(a, Room::Admins);
        hub.join(a, room.clone());

        assert_eq!(hub.publish_many(&[Room::Admins, room], &sample()), 1);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn publish_except_skips_sender() {
        let hub = Hub::new();
        let (a, mut rx_a) = connect(&hub, "u-a");
        let (b, mut rx_b) = connect(&hub, "u-b");
        let room = Room::Session("s".into());
        hub.join(a, room.clone());
        hub.join(b, room.clone());

        assert_eq!(hub.publish_except(&room, a, &sample()), 1);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }
}
