//! Idle close for active support chats.
//!
//! An active session with no message for `idle_close_secs` is closed by the
//! system. The close is conditional on `last_message_at`, so a message that
//! lands during the sweep keeps the session open.

use std::time::Duration;

use crate::activity::SYSTEM_ACTOR;
use crate::chat::session::announce_closed;
use crate::chat::{store, ChatSession};
use crate::error::ChatError;
use crate::state::AppState;

/// Close every active session idle since before `now - idle_close`.
pub async fn close_idle(state: &AppState, now: i64) -> Result<Vec<ChatSession>, ChatError> {
    let db = state.db.clone();
    let idle_since = now - (state.chat.idle_close_secs as i64) * 1000;

    let closed = tokio::task::spawn_blocking(move || -> Result<_, ChatError> {
        let conn = db
            .lock()
            .map_err(|_| ChatError::Internal("db lock poisoned".into()))?;
        let mut closed = Vec::new();
        for id in store::list_idle_active(&conn, idle_since)? {
            if let Some(session) = store::try_close_idle(&conn, &id, idle_since, now)? {
                closed.push(session);
            }
        }
        Ok(closed)
    })
    .await??;

    for session in &closed {
        announce_closed(state, session, SYSTEM_ACTOR).await;
    }
    Ok(closed)
}

pub fn spawn_idle_monitor(state: AppState) -> tokio::task::JoinHandle<()> {
    let interval = Duration::from_secs(state.chat.idle_sweep_interval_secs.max(1));

    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;

            match close_idle(&state, crate::now_millis()).await {
                Ok(closed) if !closed.is_empty() => {
                    tracing::info!("Idle sweep: closed {} chat session(s)", closed.len());
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!("Idle sweep error: {}", e);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::chat::session::tests::{claims, test_state};
    use crate::chat::session::{escalate, join, open_session};
    use crate::chat::ChatStatus;

    #[tokio::test]
    async fn only_idle_active_sessions_close() {
        let state = test_state();
        let customer = claims("cust-1", Role::Customer);
        let admin = claims("adm-1", Role::Admin);
        let active = open_session(&state, &customer).await.unwrap().into_inner();
        escalate(&state, &customer, &active.id).await.unwrap();
        join(&state, &admin, &active.id).await.unwrap();

        let waiting_owner = claims("cust-2", Role::Customer);
        let waiting = open_session(&state, &waiting_owner).await.unwrap().into_inner();
        escalate(&state, &waiting_owner, &waiting.id).await.unwrap();

        // not idle yet
        assert!(close_idle(&state, crate::now_millis()).await.unwrap().is_empty());

        let later = crate::now_millis() + (state.chat.idle_close_secs as i64 + 1) * 1000;
        let closed = close_idle(&state, later).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].id, active.id);
        assert_eq!(closed[0].status, ChatStatus::Closed);

        let conn = state.db.lock().unwrap();
        let still_waiting = store::get_session(&conn, &waiting.id).unwrap().unwrap();
        assert_eq!(still_waiting.status, ChatStatus::Waiting);
    }
}
