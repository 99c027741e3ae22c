//! Append-only activity log for admin consoles.
//!
//! Every terminal transition in dispatch and chat records one entry and
//! pushes it to the `admins` room as `newActivityLog`.

use axum::{
    extract::{Query, State},
    Json,
};
use rusqlite::{params, Connection};
use serde::Deserialize;

use crate::auth::middleware::Claims;
use crate::db::models::ActivityLog;
use crate::error::ApiError;
use crate::state::AppState;
use crate::ws::events::{ActivityLogEvent, ServerEvent};
use crate::ws::Room;

/// Actor id used for transitions the server performs on its own.
pub const SYSTEM_ACTOR: &str = "system";

const DEFAULT_LIMIT: u32 = 50;
const MAX_LIMIT: u32 = 200;

/// Entry to be recorded; `id` and `created_at` are assigned on insert.
#[derive(Debug, Clone)]
pub struct NewActivity {
    pub actor_id: String,
    pub action: &'static str,
    pub entity_type: &'static str,
    pub entity_id: String,
    pub details: String,
}

pub fn insert(conn: &Connection, entry: &NewActivity, now: i64) -> rusqlite::Result<ActivityLog> {
    conn.execute(
        "INSERT INTO activity_logs (actor_id, action, entity_type, entity_id, details, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.actor_id,
            entry.action,
            entry.entity_type,
            entry.entity_id,
            entry.details,
            now
        ],
    )?;
    Ok(ActivityLog {
        id: conn.last_insert_rowid(),
        actor_id: entry.actor_id.clone(),
        action: entry.action.to_string(),
        entity_type: entry.entity_type.to_string(),
        entity_id: entry.entity_id.clone(),
        details: entry.details.clone(),
        created_at: now,
    })
}

/// Newest first.
pub fn list_recent(conn: &Connection, limit: u32) -> rusqlite::Result<Vec<ActivityLog>> {
    let mut stmt = conn.prepare(
        "SELECT id, actor_id, action, entity_type, entity_id, details, created_at
         FROM activity_logs ORDER BY id DESC LIMIT ?1",
    )?;
    let logs = stmt
        .query_map(params![limit], ActivityLog::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(logs)
}

/// Persist an entry and notify admin consoles. Failures are logged and
/// never propagate: the transition being logged has already committed.
pub async fn record(state: &AppState, entry: NewActivity) {
    let db = state.db.clone();
    let action = entry.action;
    let result = tokio::task::spawn_blocking(move || {
        let conn = db.lock().map_err(|e| e.to_string())?;
        insert(&conn, &entry, crate::now_millis()).map_err(|e| e.to_string())
    })
    .await;

    match result {
        Ok(Ok(activity_log)) => {
            state.hub.publish(
                &Room::Admins,
                &ServerEvent::NewActivityLog(ActivityLogEvent { activity_log }),
            );
        }
        Ok(Err(e)) => tracing::warn!(action = action, "Failed to record activity: {}", e),
        Err(e) => tracing::warn!(action = action, "Activity task join error: {}", e),
    }
}

#[derive(Debug, Deserialize)]
pub struct ActivityQuery {
    pub limit: Option<u32>,
}

/// GET /api/activity-logs?limit=50 (admin only)
pub async fn list_activity_logs(
    State(state): State<AppState>,
    claims: Claims,
    Query(query): Query<ActivityQuery>,
) -> Result<Json<Vec<ActivityLog>>, ApiError> {
    claims.ensure_admin()?;
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let db = state.db.clone();
    let logs = tokio::task::spawn_blocking(move || -> Result<_, ApiError> {
        let conn = db
            .lock()
            .map_err(|e| ApiError::Internal(format!("db lock: {}", e)))?;
        Ok(list_recent(&conn, limit)?)
    })
    .await??;

    Ok(Json(logs))
}
