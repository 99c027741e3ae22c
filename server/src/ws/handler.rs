use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use serde::Deserialize;

use crate::auth::jwt;
use crate::error::ApiError;
use crate::state::AppState;
use crate::ws::actor;

/// Browsers cannot set headers on the upgrade request, so the token
/// rides in the query string.
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: String,
}

pub const CLOSE_TOKEN_EXPIRED: u16 = 4001;
pub const CLOSE_TOKEN_INVALID: u16 = 4002;

/// GET /ws?token=JWT
///
/// The upgrade always completes. A bad token gets a close frame carrying
/// 4001 or 4002 so clients can tell "log in again" from "give up".
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let claims = match jwt::validate_access_token(&state.jwt_secret, &params.token) {
        Ok(claims) => claims,
        Err(err) => {
            let code = match err {
                ApiError::TokenExpired => CLOSE_TOKEN_EXPIRED,
                _ => CLOSE_TOKEN_INVALID,
            };
            tracing::warn!(close_code = code, error = %err, "Socket rejected");
            return ws.on_upgrade(move |socket| reject(socket, code, err));
        }
    };

    tracing::info!(user_id = %claims.sub, role = %claims.role, "Socket authenticated");
    ws.on_upgrade(move |socket| actor::run_connection(socket, state, claims))
}

async fn reject(mut socket: WebSocket, code: u16, err: ApiError) {
    let frame = CloseFrame {
        code,
        reason: err.to_string().into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}
