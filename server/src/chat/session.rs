//! Chat session state machine.
//!
//! ```text
//! bot --escalate/bot miss--> waiting --join (first admin)--> active --close/idle--> closed
//!                                                           active --handoff--> active
//! ```
//!
//! Every operation commits through `chat::store` first and broadcasts after.
//! Both the socket protocol and the REST routes call into this module.

use rusqlite::Connection;

use crate::activity::{self, NewActivity};
use crate::auth::middleware::Claims;
use crate::auth::Role;
use crate::chat::bot::{self, BotReply};
use crate::chat::broadcast::{
    broadcast_admin_joined, broadcast_new_message, broadcast_session_update,
    broadcast_support_request,
};
use crate::chat::{store, typing, ChatMessage, ChatSession, ChatStatus, SenderRole};
use crate::db::Transition;
use crate::error::ChatError;
use crate::state::AppState;

/// Maximum message length (chars).
pub const MAX_MESSAGE_LENGTH: usize = 4000;

/// Run a store closure on the blocking pool with the connection locked.
async fn with_conn<T, F>(state: &AppState, f: F) -> Result<T, ChatError>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T, ChatError> + Send + 'static,
{
    let db = state.db.clone();
    tokio::task::spawn_blocking(move || {
        let conn = db
            .lock()
            .map_err(|_| ChatError::Internal("db lock poisoned".into()))?;
        f(&conn)
    })
    .await?
}

fn require_admin(claims: &Claims) -> Result<(), ChatError> {
    if claims.role == Role::Admin {
        Ok(())
    } else {
        Err(ChatError::Forbidden("admin role required"))
    }
}

/// Owners and admins may see a session. Other participants get `NotFound`
/// so session ids are not probeable.
fn can_view(claims: &Claims, session: &ChatSession) -> bool {
    match claims.role {
        Role::Admin => true,
        Role::Customer => session.customer_id == claims.sub,
        Role::Driver => false,
    }
}

/// Return the customer's open session, or start one with a bot greeting.
pub async fn open_session(
    state: &AppState,
    claims: &Claims,
) -> Result<Transition<ChatSession>, ChatError> {
    if claims.role != Role::Customer {
        return Err(ChatError::Forbidden("only customers can open a support chat"));
    }

    let customer_id = claims.sub.clone();
    let customer_name = claims.name.clone();
    let transition = with_conn(state, move |conn| {
        if let Some(existing) = store::find_open_for_customer(conn, &customer_id)? {
            return Ok(Transition::Unchanged(existing));
        }
        let now = crate::now_millis();
        let session = store::create_session(conn, &customer_id, &customer_name, now)?;
        store::append_message(conn, &session.id, SenderRole::Bot, None, bot::GREETING, now)?;
        let session = store::get_session(conn, &session.id)?.ok_or(ChatError::NotFound)?;
        Ok(Transition::Applied(session))
    })
    .await?;

    if let Transition::Applied(session) = &transition {
        tracing::info!(
            session_id = %session.id,
            customer_id = %session.customer_id,
            "Support chat opened"
        );
        broadcast_session_update(state, session);
    }
    Ok(transition)
}

/// Full snapshot of one session. REST source of truth for reconciliation.
pub async fn load_session(
    state: &AppState,
    claims: &Claims,
    session_id: &str,
) -> Result<ChatSession, ChatError> {
    let sid = session_id.to_string();
    let session = with_conn(state, move |conn| {
        store::get_session(conn, &sid)?.ok_or(ChatError::NotFound)
    })
    .await?;

    if !can_view(claims, &session) {
        return Err(ChatError::NotFound);
    }
    Ok(session)
}

/// Admin console listing, optionally filtered by status.
pub async fn list_sessions(
    state: &AppState,
    claims: &Claims,
    status: Option<ChatStatus>,
) -> Result<Vec<ChatSession>, ChatError> {
    require_admin(claims)?;
    with_conn(state, move |conn| Ok(store::list_sessions(conn, status)?)).await
}

/// Check that a participant may subscribe to a session room.
pub async fn authorize_room(
    state: &AppState,
    claims: &Claims,
    session_id: &str,
) -> Result<(), ChatError> {
    load_session(state, claims, session_id).await.map(|_| ())
}

/// What appending one message caused.
#[derive(Debug, Clone)]
pub struct PostOutcome {
    pub message: ChatMessage,
    /// Bot answer appended right after a customer message in `bot`.
    pub bot_reply: Option<ChatMessage>,
    /// Set when this message moved the session to `waiting`.
    pub escalated: Option<ChatSession>,
}

/// Append a message on behalf of a participant.
///
/// `user` messages only come from the session's customer, `admin` messages
/// only from the assigned admin while `active`, and `bot` never from a
/// client. While the session is in `bot`, a customer message is answered by
/// the FAQ bot, which escalates on request or after repeated misses.
pub async fn post_message(
    state: &AppState,
    claims: &Claims,
    session_id: &str,
    sender_role: SenderRole,
    text: &str,
) -> Result<PostOutcome, ChatError> {
    let text = text.trim().to_string();
    if text.is_empty() {
        return Err(ChatError::Invalid("message must not be empty".into()));
    }
    if text.chars().count() > MAX_MESSAGE_LENGTH {
        return Err(ChatError::Invalid(format!(
            "message exceeds {} characters",
            MAX_MESSAGE_LENGTH
        )));
    }
    match SenderRole::for_role(claims.role) {
        None => return Err(ChatError::Forbidden("drivers cannot post to support chat")),
        Some(role) if role != sender_role => {
            return Err(ChatError::Forbidden("sender role does not match participant"))
        }
        Some(_) => {}
    }

    let sid = session_id.to_string();
    let sender_id = claims.sub.clone();
    let max_misses = state.chat.bot_max_misses;
    let outcome = with_conn(state, move |conn| {
        let session = store::get_session(conn, &sid)?.ok_or(ChatError::NotFound)?;
        if session.status == ChatStatus::Closed {
            return Err(ChatError::SessionClosed);
        }
        match sender_role {
            SenderRole::User if session.customer_id != sender_id => {
                return Err(ChatError::Forbidden("not a participant of this session"));
            }
            SenderRole::Admin
                if session.status != ChatStatus::Active
                    || session.assigned_admin_id.as_deref() != Some(sender_id.as_str()) =>
            {
                return Err(ChatError::Forbidden("only the assigned admin can reply"));
            }
            _ => {}
        }

        let now = crate::now_millis();
        let message = store::append_message(conn, &sid, sender_role, Some(&sender_id), &text, now)?;

        if sender_role != SenderRole::User || session.status != ChatStatus::Bot {
            return Ok(PostOutcome {
                message,
                bot_reply: None,
                escalated: None,
            });
        }

        let reply = match bot::respond(&text) {
            BotReply::Answer(answer) => {
                store::reset_bot_misses(conn, &sid)?;
                BotReply::Answer(answer)
            }
            BotReply::Escalate => BotReply::Escalate,
            BotReply::Miss => {
                let misses = store::record_bot_miss(conn, &sid)?;
                if misses >= max_misses {
                    BotReply::Escalate
                } else {
                    BotReply::Miss
                }
            }
        };

        let bot_reply =
            store::append_message(conn, &sid, SenderRole::Bot, None, reply.text(), now)?;
        let escalated = match reply {
            BotReply::Escalate => match store::try_escalate(conn, &sid, now)? {
                Transition::Applied(session) => Some(session),
                Transition::Unchanged(_) => None,
            },
            _ => None,
        };

        Ok(PostOutcome {
            message,
            bot_reply: Some(bot_reply),
            escalated,
        })
    })
    .await?;

    typing::clear(state, session_id, &claims.sub);
    broadcast_new_message(state, &outcome.message);
    if let Some(reply) = &outcome.bot_reply {
        broadcast_new_message(state, reply);
    }
    if let Some(session) = &outcome.escalated {
        announce_escalated(state, session, &claims.sub).await;
    }

    Ok(outcome)
}

/// Customer asks for a human. No-op if the session already left `bot`.
pub async fn escalate(
    state: &AppState,
    claims: &Claims,
    session_id: &str,
) -> Result<ChatSession, ChatError> {
    load_session(state, claims, session_id).await?;

    let sid = session_id.to_string();
    let transition = with_conn(state, move |conn| {
        let now = crate::now_millis();
        let transition = store::try_escalate(conn, &sid, now)?;
        if transition.was_applied() {
            store::append_message(conn, &sid, SenderRole::Bot, None, bot::HANDOFF_NOTICE, now)?;
            let session = store::get_session(conn, &sid)?.ok_or(ChatError::NotFound)?;
            return Ok(Transition::Applied(session));
        }
        Ok(transition)
    })
    .await?;

    match transition {
        Transition::Applied(session) => {
            if let Some(notice) = session.messages.last() {
                broadcast_new_message(state, notice);
            }
            announce_escalated(state, &session, &claims.sub).await;
            Ok(session)
        }
        Transition::Unchanged(session) => Ok(session),
    }
}

async fn announce_escalated(state: &AppState, session: &ChatSession, actor_id: &str) {
    tracing::info!(session_id = %session.id, "Support chat waiting for an admin");
    broadcast_session_update(state, session);
    broadcast_support_request(state, session);
    activity::record(
        state,
        NewActivity {
            actor_id: actor_id.to_string(),
            action: "chat.escalated",
            entity_type: "chat_session",
            entity_id: session.id.clone(),
            details: session.customer_name.clone(),
        },
    )
    .await;
}

/// Admin takes a waiting session. Exactly one admin wins a race; the
/// others get `SessionAlreadyActive`.
pub async fn join(
    state: &AppState,
    claims: &Claims,
    session_id: &str,
) -> Result<ChatSession, ChatError> {
    require_admin(claims)?;

    let sid = session_id.to_string();
    let admin_id = claims.sub.clone();
    let transition = with_conn(state, move |conn| {
        store::try_join(conn, &sid, &admin_id, crate::now_millis())
    })
    .await?;

    let session = match transition {
        Transition::Unchanged(session) => return Ok(session),
        Transition::Applied(session) => session,
    };

    tracing::info!(
        session_id = %session.id,
        admin_id = %claims.sub,
        "Admin joined support chat"
    );
    broadcast_session_update(state, &session);
    broadcast_admin_joined(state, &session.id, &claims.sub, &claims.name);
    activity::record(
        state,
        NewActivity {
            actor_id: claims.sub.clone(),
            action: "chat.joined",
            entity_type: "chat_session",
            entity_id: session.id.clone(),
            details: session.customer_name.clone(),
        },
    )
    .await;

    Ok(session)
}

/// Assigned admin passes an active session to another admin. The target
/// must be an admin with a live connection, so someone can pick it up.
pub async fn handoff(
    state: &AppState,
    claims: &Claims,
    session_id: &str,
    to_admin: &str,
) -> Result<ChatSession, ChatError> {
    require_admin(claims)?;
    if to_admin.trim().is_empty() {
        return Err(ChatError::Invalid("toAdminId is required".into()));
    }
    if to_admin == claims.sub {
        return Err(ChatError::Invalid("cannot hand off to yourself".into()));
    }
    let target = state
        .presence
        .get(to_admin)
        .filter(|p| p.role == Role::Admin)
        .ok_or_else(|| ChatError::Invalid(format!("{} is not an online admin", to_admin)))?;

    let sid = session_id.to_string();
    let from = claims.sub.clone();
    let to = to_admin.to_string();
    let transition = with_conn(state, move |conn| {
        store::try_handoff(conn, &sid, &from, &to, crate::now_millis())
    })
    .await?;

    let session = match transition {
        Transition::Unchanged(session) => return Ok(session),
        Transition::Applied(session) => session,
    };

    tracing::info!(
        session_id = %session.id,
        from_admin = %claims.sub,
        to_admin = %to_admin,
        "Support chat handed off"
    );
    broadcast_session_update(state, &session);
    broadcast_admin_joined(state, &session.id, to_admin, &target.name);
    activity::record(
        state,
        NewActivity {
            actor_id: claims.sub.clone(),
            action: "chat.handoff",
            entity_type: "chat_session",
            entity_id: session.id.clone(),
            details: format!("to {}", to_admin),
        },
    )
    .await;

    Ok(session)
}

/// Assigned admin closes an active session. Closing twice is a no-op.
pub async fn close(
    state: &AppState,
    claims: &Claims,
    session_id: &str,
) -> Result<ChatSession, ChatError> {
    require_admin(claims)?;

    let sid = session_id.to_string();
    let admin_id = claims.sub.clone();
    let transition = with_conn(state, move |conn| {
        store::try_close(conn, &sid, &admin_id, crate::now_millis())
    })
    .await?;

    match transition {
        Transition::Unchanged(session) => Ok(session),
        Transition::Applied(session) => {
            announce_closed(state, &session, &claims.sub).await;
            Ok(session)
        }
    }
}

pub(crate) async fn announce_closed(state: &AppState, session: &ChatSession, actor_id: &str) {
    tracing::info!(session_id = %session.id, closed_by = %actor_id, "Support chat closed");
    broadcast_session_update(state, session);
    activity::record(
        state,
        NewActivity {
            actor_id: actor_id.to_string(),
            action: "chat.closed",
            entity_type: "chat_session",
            entity_id: session.id.clone(),
            details: session.customer_name.clone(),
        },
    )
    .await;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::Config;

    pub(crate) fn test_state() -> AppState {
        let db = crate::db::init_memory_db().unwrap();
        AppState::new(db, vec![3u8; 32], &Config::default())
    }

    pub(crate) fn claims(id: &str, role: Role) -> Claims {
        Claims {
            sub: id.to_string(),
            name: format!("{id} name"),
            role,
            iat: 0,
            exp: i64::MAX,
        }
    }

    #[tokio::test]
    async fn open_session_is_reused_and_greets_once() {
        let state = test_state();
        let customer = claims("cust-1", Role::Customer);
        let first = open_session(&state, &customer).await.unwrap();
        let second = open_session(&state, &customer).await.unwrap();
        assert!(first.was_applied());
        assert!(!second.was_applied());
        assert_eq!(first.get().id, second.get().id);
        assert_eq!(second.get().messages.len(), 1);
        assert_eq!(second.get().messages[0].sender_role, SenderRole::Bot);
    }

    #[tokio::test]
    async fn bot_answers_then_escalates_after_repeated_misses() {
        let state = test_state();
        let customer = claims("cust-1", Role::Customer);
        let session = open_session(&state, &customer).await.unwrap().into_inner();

        let answered = post_message(
            &state,
            &customer,
            &session.id,
            SenderRole::User,
            "what does it cost",
        )
        .await
        .unwrap();
        assert!(answered.bot_reply.is_some());
        assert!(answered.escalated.is_none());

        let miss = post_message(&state, &customer, &session.id, SenderRole::User, "zebra")
            .await
            .unwrap();
        assert!(miss.escalated.is_none());
        let second_miss =
            post_message(&state, &customer, &session.id, SenderRole::User, "giraffe")
                .await
                .unwrap();
        let escalated = second_miss.escalated.expect("second miss escalates");
        assert_eq!(escalated.status, ChatStatus::Waiting);
    }

    #[tokio::test]
    async fn customer_cannot_post_as_admin_or_into_foreign_session() {
        let state = test_state();
        let owner = claims("cust-1", Role::Customer);
        let other = claims("cust-2", Role::Customer);
        let session = open_session(&state, &owner).await.unwrap().into_inner();

        let err = post_message(&state, &owner, &session.id, SenderRole::Admin, "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));
        let err = post_message(&state, &other, &session.id, SenderRole::User, "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));
        let err = load_session(&state, &other, &session.id).await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound));
    }

    #[tokio::test]
    async fn only_assigned_admin_replies_and_closes() {
        let state = test_state();
        let customer = claims("cust-1", Role::Customer);
        let adm_a = claims("adm-a", Role::Admin);
        let adm_b = claims("adm-b", Role::Admin);
        let session = open_session(&state, &customer).await.unwrap().into_inner();
        escalate(&state, &customer, &session.id).await.unwrap();

        join(&state, &adm_a, &session.id).await.unwrap();
        let err = join(&state, &adm_b, &session.id).await.unwrap_err();
        assert!(matches!(err, ChatError::SessionAlreadyActive));

        let err = post_message(&state, &adm_b, &session.id, SenderRole::Admin, "hello")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Forbidden(_)));
        post_message(&state, &adm_a, &session.id, SenderRole::Admin, "hello")
            .await
            .unwrap();

        let closed = close(&state, &adm_a, &session.id).await.unwrap();
        assert_eq!(closed.status, ChatStatus::Closed);
        let err = post_message(
            &state,
            &customer,
            &session.id,
            SenderRole::User,
            "still there?",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ChatError::SessionClosed));
    }

    #[tokio::test]
    async fn handoff_moves_assignment() {
        let state = test_state();
        let customer = claims("cust-1", Role::Customer);
        let adm_a = claims("adm-a", Role::Admin);
        let adm_b = claims("adm-b", Role::Admin);
        let session = open_session(&state, &customer).await.unwrap().into_inner();
        escalate(&state, &customer, &session.id).await.unwrap();
        join(&state, &adm_a, &session.id).await.unwrap();

        let err = handoff(&state, &adm_a, &session.id, "adm-b").await.unwrap_err();
        assert!(matches!(err, ChatError::Invalid(_)));
        state.presence.connect("cust-1", "Cleo", Role::Customer, 0);
        let err = handoff(&state, &adm_a, &session.id, "cust-1").await.unwrap_err();
        assert!(matches!(err, ChatError::Invalid(_)));

        state.presence.connect("adm-b", "Bo", Role::Admin, 0);
        let moved = handoff(&state, &adm_a, &session.id, "adm-b").await.unwrap();
        assert_eq!(moved.assigned_admin_id.as_deref(), Some("adm-b"));
        post_message(&state, &adm_b, &session.id, SenderRole::Admin, "taking over")
            .await
            .unwrap();
    }
}
