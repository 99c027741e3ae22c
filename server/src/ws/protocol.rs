use crate::auth::middleware::Claims;
use crate::auth::Role;
use crate::chat::{session, typing};
use crate::dispatch::{arbiter, store};
use crate::error::{ChatError, DispatchError, ErrorCategory};
use crate::state::AppState;
use crate::ws::events::{
    ClientEvent, DriverRegisteredEvent, ErrorEvent, MessageEvent, OnlineUsersEvent, ServerEvent,
};
use crate::ws::{ConnectionId, Room};

/// Identity of the socket a frame arrived on.
pub struct ConnCtx {
    pub conn_id: ConnectionId,
    pub claims: Claims,
}

/// Handle one incoming text frame.
/// Decodes the event, dispatches by name, and answers errors to the sender only.
pub async fn handle_text(text: &str, ctx: &ConnCtx, state: &AppState) {
    let event = match serde_json::from_str::<ClientEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(
                user_id = %ctx.claims.sub,
                error = %e,
                "Failed to decode client event"
            );
            send_error(
                state,
                ctx,
                ErrorEvent {
                    category: ErrorCategory::Invalid,
                    code: "bad_event".into(),
                    message: "Invalid event frame".into(),
                },
            );
            return;
        }
    };

    tracing::debug!(
        user_id = %ctx.claims.sub,
        event = event.name(),
        "Client event"
    );
    dispatch_event(event, ctx, state).await;
}

async fn dispatch_event(event: ClientEvent, ctx: &ConnCtx, state: &AppState) {
    match event {
        ClientEvent::DriverRegister(payload) => {
            handle_driver_register(&payload.driver_id, ctx, state).await;
        }
        ClientEvent::DriverAccept(payload) => {
            if ctx.claims.role != Role::Driver || payload.driver_id != ctx.claims.sub {
                let err = DispatchError::Forbidden("driver id does not match token");
                send_dispatch_error(state, ctx, &err);
                return;
            }
            // Success is announced by the arbiter via driver_accepted.
            let outcome =
                arbiter::accept_by_booking(state, &payload.booking_id, &ctx.claims.sub).await;
            if let Err(e) = outcome {
                send_dispatch_error(state, ctx, &e);
            }
        }
        ClientEvent::DriverDecline(payload) => {
            if ctx.claims.role != Role::Driver {
                send_dispatch_error(state, ctx, &DispatchError::Forbidden("drivers only"));
                return;
            }
            let outcome =
                arbiter::decline_by_booking(state, &payload.booking_id, &ctx.claims.sub).await;
            if let Err(e) = outcome {
                send_dispatch_error(state, ctx, &e);
            }
        }
        ClientEvent::JoinRoom(payload) => {
            match session::authorize_room(state, &ctx.claims, &payload.session_id).await {
                Ok(()) => state.hub.join(ctx.conn_id, Room::Session(payload.session_id)),
                Err(e) => send_chat_error(state, ctx, &e),
            }
        }
        ClientEvent::LeaveRoom(payload) => {
            typing::clear(state, &payload.session_id, &ctx.claims.sub);
            state
                .hub
                .leave(ctx.conn_id, &Room::Session(payload.session_id));
        }
        ClientEvent::JoinAdminRoom => {
            if ctx.claims.role != Role::Admin {
                send_chat_error(state, ctx, &ChatError::Forbidden("admin role required"));
                return;
            }
            state.hub.join(ctx.conn_id, Room::Admins);
        }
        ClientEvent::SendMessage(payload) => {
            if let Err(e) = session::post_message(
                state,
                &ctx.claims,
                &payload.session_id,
                payload.sender_role,
                &payload.message,
            )
            .await
            {
                send_chat_error(state, ctx, &e);
            }
        }
        ClientEvent::Typing(payload) => {
            let room = Room::Session(payload.session_id.clone());
            if !state.hub.is_member(ctx.conn_id, &room) {
                send_chat_error(state, ctx, &ChatError::Forbidden("join the session room first"));
                return;
            }
            typing::set_typing(
                state,
                ctx.conn_id,
                &payload.session_id,
                &ctx.claims.sub,
                payload.is_typing,
            );
        }
        ClientEvent::GetOnlineUsers => {
            let users = state.presence.list_online(None);
            state
                .hub
                .send_to_conn(ctx.conn_id, &ServerEvent::OnlineUsers(OnlineUsersEvent { users }));
        }
    }
}

/// `driver:register`: the token must belong to that driver and the stored
/// profile must be license-verified.
async fn handle_driver_register(driver_id: &str, ctx: &ConnCtx, state: &AppState) {
    let reject = |message: &str| {
        tracing::info!(
            user_id = %ctx.claims.sub,
            driver_id = %driver_id,
            reason = message,
            "Driver registration rejected"
        );
        state.hub.send_to_conn(
            ctx.conn_id,
            &ServerEvent::DriverRegisterError(MessageEvent {
                message: message.to_string(),
            }),
        );
    };

    if ctx.claims.role != Role::Driver {
        reject("only drivers can register for dispatch");
        return;
    }
    if driver_id != ctx.claims.sub {
        reject("driver id does not match token");
        return;
    }

    let db = state.db.clone();
    let did = driver_id.to_string();
    let verified = tokio::task::spawn_blocking(move || -> Result<bool, DispatchError> {
        let conn = db
            .lock()
            .map_err(|_| DispatchError::Internal("db lock poisoned".into()))?;
        Ok(store::is_driver_verified(&conn, &did)?)
    })
    .await;

    match verified {
        Ok(Ok(true)) => {}
        Ok(Ok(false)) => {
            reject("driver license is not verified");
            return;
        }
        Ok(Err(e)) => {
            tracing::error!(driver_id = %driver_id, error = %e, "Driver lookup failed");
            reject("registration unavailable");
            return;
        }
        Err(e) => {
            tracing::error!(driver_id = %driver_id, error = %e, "Driver lookup task failed");
            reject("registration unavailable");
            return;
        }
    }

    if !state.presence.register_driver(driver_id, crate::now_millis()) {
        reject("driver is not connected");
        return;
    }
    state.hub.send_to_conn(
        ctx.conn_id,
        &ServerEvent::DriverRegistered(DriverRegisteredEvent {
            driver_id: driver_id.to_string(),
        }),
    );
    tracing::info!(driver_id = %driver_id, "Driver registered for dispatch");
}

fn send_error(state: &AppState, ctx: &ConnCtx, event: ErrorEvent) {
    state.hub.send_to_conn(ctx.conn_id, &ServerEvent::Error(event));
}

fn send_dispatch_error(state: &AppState, ctx: &ConnCtx, err: &DispatchError) {
    if err.category() == ErrorCategory::Internal {
        tracing::error!(user_id = %ctx.claims.sub, error = %err, "Dispatch event failed");
    }
    send_error(state, ctx, ErrorEvent::from(err));
}

fn send_chat_error(state: &AppState, ctx: &ConnCtx, err: &ChatError) {
    if err.category() == ErrorCategory::Internal {
        tracing::error!(user_id = %ctx.claims.sub, error = %err, "Chat event failed");
    }
    send_error(state, ctx, ErrorEvent::from(err));
}
