//! REST endpoints for support chat. The session snapshot served here is
//! what reconnecting clients reconcile against.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use crate::auth::middleware::Claims;
use crate::chat::{session, ChatMessage, ChatSession, ChatStatus, SenderRole};
use crate::error::ChatError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SessionListQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMessageRequest {
    pub sender_role: SenderRole,
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandoffRequest {
    pub to_admin_id: String,
}

/// POST /api/chat/sessions
///
/// Open (or resume) the caller's support chat.
/// 201 when a new session was started, 200 when an open one is returned.
pub async fn open_session(
    State(state): State<AppState>,
    claims: Claims,
) -> Result<(StatusCode, Json<ChatSession>), ChatError> {
    let transition = session::open_session(&state, &claims).await?;
    let status = if transition.was_applied() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(transition.into_inner())))
}

/// GET /api/chat/sessions?status=
///
/// Admin console listing.
pub async fn list_sessions(
    State(state): State<AppState>,
    claims: Claims,
    Query(query): Query<SessionListQuery>,
) -> Result<Json<Vec<ChatSession>>, ChatError> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(
            ChatStatus::parse(raw)
                .ok_or_else(|| ChatError::Invalid(format!("unknown status '{}'", raw)))?,
        ),
    };
    let sessions = session::list_sessions(&state, &claims, status).await?;
    Ok(Json(sessions))
}

/// GET /api/chat/sessions/{id}
///
/// Session with its ordered message history.
pub async fn get_session(
    State(state): State<AppState>,
    claims: Claims,
    Path(session_id): Path<String>,
) -> Result<Json<ChatSession>, ChatError> {
    let session = session::load_session(&state, &claims, &session_id).await?;
    Ok(Json(session))
}

/// POST /api/chat/sessions/{id}/messages
pub async fn post_message(
    State(state): State<AppState>,
    claims: Claims,
    Path(session_id): Path<String>,
    Json(body): Json<PostMessageRequest>,
) -> Result<(StatusCode, Json<ChatMessage>), ChatError> {
    let outcome =
        session::post_message(&state, &claims, &session_id, body.sender_role, &body.message)
            .await?;
    Ok((StatusCode::CREATED, Json(outcome.message)))
}

/// POST /api/chat/sessions/{id}/escalate
pub async fn escalate(
    State(state): State<AppState>,
    claims: Claims,
    Path(session_id): Path<String>,
) -> Result<Json<ChatSession>, ChatError> {
    Ok(Json(session::escalate(&state, &claims, &session_id).await?))
}

/// POST /api/chat/sessions/{id}/join
///
/// Losers get 409 `session_already_active`.
pub async fn join(
    State(state): State<AppState>,
    claims: Claims,
    Path(session_id): Path<String>,
) -> Result<Json<ChatSession>, ChatError> {
    Ok(Json(session::join(&state, &claims, &session_id).await?))
}

/// POST /api/chat/sessions/{id}/handoff
pub async fn handoff(
    State(state): State<AppState>,
    claims: Claims,
    Path(session_id): Path<String>,
    Json(body): Json<HandoffRequest>,
) -> Result<Json<ChatSession>, ChatError> {
    let session = session::handoff(&state, &claims, &session_id, &body.to_admin_id).await?;
    Ok(Json(session))
}

/// POST /api/chat/sessions/{id}/close
pub async fn close(
    State(state): State<AppState>,
    claims: Claims,
    Path(session_id): Path<String>,
) -> Result<Json<ChatSession>, ChatError> {
    Ok(Json(session::close(&state, &claims, &session_id).await?))
}
