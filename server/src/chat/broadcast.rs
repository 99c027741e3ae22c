//! WebSocket broadcast helpers for chat events.
//! Session changes go to admin consoles and to the session room; messages
//! and join notices to both as well, each connection receiving one copy.

use crate::chat::{ChatMessage, ChatSession};
use crate::state::AppState;
use crate::ws::events::{AdminJoinedEvent, NewMessageEvent, ServerEvent, SessionEvent};
use crate::ws::Room;

fn audience(session_id: &str) -> [Room; 2] {
    [Room::Admins, Room::Session(session_id.to_string())]
}

/// Broadcast `chatUpdate` after any transition.
pub fn broadcast_session_update(state: &AppState, session: &ChatSession) {
    state.hub.publish_many(
        &audience(&session.id),
        &ServerEvent::ChatUpdate(SessionEvent::from(session)),
    );
}

/// Broadcast `newSupportRequest` when a session enters the waiting queue.
pub fn broadcast_support_request(state: &AppState, session: &ChatSession) {
    state.hub.publish(
        &Room::Admins,
        &ServerEvent::NewSupportRequest(SessionEvent::from(session)),
    );
}

/// Broadcast `adminJoined` once an admin won the join.
pub fn broadcast_admin_joined(
    state: &AppState,
    session_id: &str,
    admin_id: &str,
    admin_name: &str,
) {
    state.hub.publish_many(
        &audience(session_id),
        &ServerEvent::AdminJoined(AdminJoinedEvent {
            session_id: session_id.to_string(),
            admin_id: admin_id.to_string(),
            admin_name: admin_name.to_string(),
        }),
    );
}

/// Broadcast `newMessage` for an appended message.
pub fn broadcast_new_message(state: &AppState, message: &ChatMessage) {
    state.hub.publish_many(
        &audience(&message.session_id),
        &ServerEvent::NewMessage(NewMessageEvent {
            session_id: message.session_id.clone(),
            sender_role: message.sender_role,
            message: message.text.clone(),
            created_at: message.created_at,
        }),
    );
}
