//! Ephemeral typing indicators. Never persisted.
//!
//! Each `typing{isTyping: true}` refreshes a generation number and arms a
//! timer; if no newer refresh arrives before it fires, the indicator is
//! cleared and `userTyping{isTyping: false}` is sent.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::state::AppState;
use crate::ws::events::{ServerEvent, UserTypingEvent};
use crate::ws::{ConnectionId, Room};

type TypingKey = (String, String);

#[derive(Clone)]
pub struct TypingTracker {
    /// (session_id, user_id) -> generation of the latest refresh
    active: Arc<DashMap<TypingKey, u64>>,
    next_generation: Arc<AtomicU64>,
    timeout: Duration,
}

impl TypingTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            active: Arc::new(DashMap::new()),
            next_generation: Arc::new(AtomicU64::new(1)),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Mark a user typing. Returns whether this started a new indicator and
    /// the generation the auto-clear timer must match.
    pub fn start(&self, session_id: &str, user_id: &str) -> (bool, u64) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .active
            .insert((session_id.to_string(), user_id.to_string()), generation);
        (previous.is_none(), generation)
    }

    /// Explicit stop. Returns true if an indicator was showing.
    pub fn stop(&self, session_id: &str, user_id: &str) -> bool {
        self.active
            .remove(&(session_id.to_string(), user_id.to_string()))
            .is_some()
    }

    /// Timer path: clear only if no refresh happened since `generation`.
    pub fn expire(&self, session_id: &str, user_id: &str, generation: u64) -> bool {
        self.active
            .remove_if(&(session_id.to_string(), user_id.to_string()), |_, g| {
                *g == generation
            })
            .is_some()
    }

    /// Drop every indicator of a user. Returns the affected sessions.
    pub fn clear_user(&self, user_id: &str) -> Vec<String> {
        let keys: Vec<TypingKey> = self
            .active
            .iter()
            .filter(|e| e.key().1 == user_id)
            .map(|e| e.key().clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| self.active.remove(&key).map(|((session, _), _)| session))
            .collect()
    }

    pub fn is_typing(&self, session_id: &str, user_id: &str) -> bool {
        self.active
            .contains_key(&(session_id.to_string(), user_id.to_string()))
    }
}

fn typing_event(session_id: &str, user_id: &str, is_typing: bool) -> ServerEvent {
    ServerEvent::UserTyping(UserTypingEvent {
        session_id: session_id.to_string(),
        user_id: user_id.to_string(),
        is_typing,
    })
}

/// Apply a `typing` event from one connection and relay it to the other
/// members of the session room.
pub fn set_typing(
    state: &AppState,
    conn_id: ConnectionId,
    session_id: &str,
    user_id: &str,
    is_typing: bool,
) {
    let room = Room::Session(session_id.to_string());

    if !is_typing {
        if state.typing.stop(session_id, user_id) {
            state
                .hub
                .publish_except(&room, conn_id, &typing_event(session_id, user_id, false));
        }
        return;
    }

    let (started, generation) = state.typing.start(session_id, user_id);
    if started {
        state
            .hub
            .publish_except(&room, conn_id, &typing_event(session_id, user_id, true));
    }

    let state = state.clone();
    let session_id = session_id.to_string();
    let user_id = user_id.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(state.typing.timeout()).await;
        if state.typing.expire(&session_id, &user_id, generation) {
            tracing::debug!(
                session_id = %session_id,
                user_id = %user_id,
                "Typing indicator expired"
            );
            state.hub.publish(
                &Room::Session(session_id.clone()),
                &typing_event(&session_id, &user_id, false),
            );
        }
    });
}

/// Clear a user's indicators after their message was sent or they left.
pub fn clear_user(state: &AppState, user_id: &str) {
    for session_id in state.typing.clear_user(user_id) {
        state.hub.publish(
            &Room::Session(session_id.clone()),
            &typing_event(&session_id, user_id, false),
        );
    }
}

/// Clear one indicator, e.g. when the typist's message arrives.
pub fn clear(state: &AppState, session_id: &str, user_id: &str) {
    if state.typing.stop(session_id, user_id) {
        state.hub.publish(
            &Room::Session(session_id.to_string()),
            &typing_event(session_id, user_id, false),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_outlives_an_older_timer() {
        let tracker = TypingTracker::new(Duration::from_secs(3));
        let (started, first) = tracker.start("s-1", "cust-1");
        assert!(started);
        let (started, second) = tracker.start("s-1", "cust-1");
        assert!(!started);

        // the first timer fires but a newer refresh exists
        assert!(!tracker.expire("s-1", "cust-1", first));
        assert!(tracker.is_typing("s-1", "cust-1"));
        assert!(tracker.expire("s-1", "cust-1", second));
        assert!(!tracker.is_typing("s-1", "cust-1"));
    }

    #[test]
    fn clear_user_reports_every_session() {
        let tracker = TypingTracker::new(Duration::from_secs(3));
        tracker.start("s-1", "adm-1");
        tracker.start("s-2", "adm-1");
        tracker.start("s-2", "cust-2");

        let mut sessions = tracker.clear_user("adm-1");
        sessions.sort();
        assert_eq!(sessions, vec!["s-1".to_string(), "s-2".to_string()]);
        assert!(tracker.is_typing("s-2", "cust-2"));
    }

    #[tokio::test]
    async fn indicator_clears_after_inactivity() {
        let db = crate::db::init_memory_db().unwrap();
        let mut config = crate::config::Config::default();
        config.chat.typing_timeout_ms = 50;
        let state = AppState::new(db, vec![1u8; 32], &config);

        set_typing(&state, uuid::Uuid::new_v4(), "s-1", "cust-1", true);
        assert!(state.typing.is_typing("s-1", "cust-1"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!state.typing.is_typing("s-1", "cust-1"));
    }
}
