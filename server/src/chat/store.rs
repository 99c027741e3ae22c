//! Authoritative chat session storage.
//!
//! Status changes are conditional updates on the expected current status
//! (and assignee, for hand-off). Messages are appended inside a transaction
//! that refuses closed sessions.

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::chat::{ChatMessage, ChatSession, ChatStatus, SenderRole};
use crate::db::Transition;
use crate::error::ChatError;

const SESSION_COLUMNS: &str = "id, customer_id, customer_name, status, assigned_admin_id, \
     created_at, updated_at, last_message_at, closed_at";

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatSession> {
    Ok(ChatSession {
        id: row.get(0)?,
        customer_id: row.get(1)?,
        customer_name: row.get(2)?,
        status: row.get(3)?,
        assigned_admin_id: row.get(4)?,
        messages: Vec::new(),
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
        last_message_at: row.get(7)?,
        closed_at: row.get(8)?,
    })
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    Ok(ChatMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        sender_role: row.get(2)?,
        sender_id: row.get(3)?,
        text: row.get(4)?,
        created_at: row.get(5)?,
    })
}

/// Messages of a session by timestamp, ties in arrival order.
pub fn list_messages(conn: &Connection, session_id: &str) -> rusqlite::Result<Vec<ChatMessage>> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, sender_role, sender_id, text, created_at
         FROM chat_messages WHERE session_id = ?1
         ORDER BY created_at ASC, id ASC",
    )?;
    let messages = stmt
        .query_map(params![session_id], message_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(messages)
}

fn with_messages(conn: &Connection, mut session: ChatSession) -> rusqlite::Result<ChatSession> {
    session.messages = list_messages(conn, &session.id)?;
    Ok(session)
}

/// Full snapshot including messages.
pub fn get_session(conn: &Connection, session_id: &str) -> rusqlite::Result<Option<ChatSession>> {
    let session = conn
        .query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM chat_sessions WHERE id = ?1"),
            params![session_id],
            session_from_row,
        )
        .optional()?;
    session.map(|s| with_messages(conn, s)).transpose()
}

fn require_session(conn: &Connection, session_id: &str) -> Result<ChatSession, ChatError> {
    get_session(conn, session_id)?.ok_or(ChatError::NotFound)
}

/// The customer's current non-closed session, if any.
pub fn find_open_for_customer(
    conn: &Connection,
    customer_id: &str,
) -> rusqlite::Result<Option<ChatSession>> {
    let session = conn
        .query_row(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM chat_sessions
                 WHERE customer_id = ?1 AND status != 'closed'
                 ORDER BY created_at DESC LIMIT 1"
            ),
            params![customer_id],
            session_from_row,
        )
        .optional()?;
    session.map(|s| with_messages(conn, s)).transpose()
}

/// Sessions for the admin console, most recently active first.
pub fn list_sessions(
    conn: &Connection,
    status: Option<ChatStatus>,
) -> rusqlite::Result<Vec<ChatSession>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SESSION_COLUMNS} FROM chat_sessions
         WHERE ?1 IS NULL OR status = ?1
         ORDER BY last_message_at DESC, id ASC"
    ))?;
    let sessions = stmt
        .query_map(params![status], session_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    sessions
        .into_iter()
        .map(|s| with_messages(conn, s))
        .collect()
}

pub fn create_session(
    conn: &Connection,
    customer_id: &str,
    customer_name: &str,
    now: i64,
) -> rusqlite::Result<ChatSession> {
    let id = Uuid::now_v7().to_string();
    conn.execute(
        "INSERT INTO chat_sessions (id, customer_id, customer_name, status, created_at,
                                    updated_at, last_message_at)
         VALUES (?1, ?2, ?3, 'bot', ?4, ?4, ?4)",
        params![id, customer_id, customer_name, now],
    )?;
    Ok(ChatSession {
        id,
        customer_id: customer_id.to_string(),
        customer_name: customer_name.to_string(),
        status: ChatStatus::Bot,
        assigned_admin_id: None,
        messages: Vec::new(),
        created_at: now,
        updated_at: now,
        last_message_at: now,
        closed_at: None,
    })
}

/// Append a message. Its timestamp is clamped to the session's
/// `last_message_at` so ordering within a session never goes backwards.
pub fn append_message(
    conn: &Connection,
    session_id: &str,
    sender_role: SenderRole,
    sender_id: Option<&str>,
    text: &str,
    now: i64,
) -> Result<ChatMessage, ChatError> {
    let tx = conn.unchecked_transaction()?;

    let current: Option<(ChatStatus, i64)> = tx
        .query_row(
            "SELECT status, last_message_at FROM chat_sessions WHERE id = ?1",
            params![session_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let (status, last_message_at) = current.ok_or(ChatError::NotFound)?;
    if !status.accepts_messages() {
        return Err(ChatError::SessionClosed);
    }

    let created_at = now.max(last_message_at);
    tx.execute(
        "INSERT INTO chat_messages (session_id, sender_role, sender_id, text, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![session_id, sender_role, sender_id, text, created_at],
    )?;
    let id = tx.last_insert_rowid();
    tx.execute(
        "UPDATE chat_sessions SET last_message_at = ?2, updated_at = ?2 WHERE id = ?1",
        params![session_id, created_at],
    )?;
    tx.commit()?;

    Ok(ChatMessage {
        id,
        session_id: session_id.to_string(),
        sender_role,
        sender_id: sender_id.map(str::to_string),
        text: text.to_string(),
        created_at,
    })
}

/// `bot -> waiting`. Escalating a session that already left `bot` is a
/// no-op; a closed session cannot be escalated.
pub fn try_escalate(
    conn: &Connection,
    session_id: &str,
    now: i64,
) -> Result<Transition<ChatSession>, ChatError> {
    let changed = conn.execute(
        "UPDATE chat_sessions SET status = 'waiting', bot_misses = 0, updated_at = ?2
         WHERE id = ?1 AND status = 'bot'",
        params![session_id, now],
    )?;

    let session = require_session(conn, session_id)?;
    if changed == 1 {
        return Ok(Transition::Applied(session));
    }
    match session.status {
        ChatStatus::Closed => Err(ChatError::SessionClosed),
        _ => Ok(Transition::Unchanged(session)),
    }
}

/// `waiting -> active` with `admin_id` as assignee. The first admin wins;
/// a repeat by the winner is `Unchanged`, anyone else gets
/// `SessionAlreadyActive` and the assignment stays as it is.
pub fn try_join(
    conn: &Connection,
    session_id: &str,
    admin_id: &str,
    now: i64,
) -> Result<Transition<ChatSession>, ChatError> {
    let changed = conn.execute(
        "UPDATE chat_sessions SET status = 'active', assigned_admin_id = ?2, updated_at = ?3
         WHERE id = ?1 AND status = 'waiting'",
        params![session_id, admin_id, now],
    )?;

    let session = require_session(conn, session_id)?;
    if changed == 1 {
        return Ok(Transition::Applied(session));
    }
    match session.status {
        ChatStatus::Active if session.assigned_admin_id.as_deref() == Some(admin_id) => {
            Ok(Transition::Unchanged(session))
        }
        ChatStatus::Active => Err(ChatError::SessionAlreadyActive),
        ChatStatus::Closed => Err(ChatError::SessionClosed),
        from => Err(ChatError::InvalidTransition {
            from,
            to: ChatStatus::Active,
        }),
    }
}

/// `active -> active` moving the assignment from `from_admin` to `to_admin`.
pub fn try_handoff(
    conn: &Connection,
    session_id: &str,
    from_admin: &str,
    to_admin: &str,
    now: i64,
) -> Result<Transition<ChatSession>, ChatError> {
    let changed = conn.execute(
        "UPDATE chat_sessions SET assigned_admin_id = ?3, updated_at = ?4
         WHERE id = ?1 AND status = 'active' AND assigned_admin_id = ?2",
        params![session_id, from_admin, to_admin, now],
    )?;

    let session = require_session(conn, session_id)?;
    if changed == 1 {
        return Ok(Transition::Applied(session));
    }
    match session.status {
        ChatStatus::Active if session.assigned_admin_id.as_deref() == Some(to_admin) => {
            Ok(Transition::Unchanged(session))
        }
        ChatStatus::Active => Err(ChatError::Forbidden("only the assigned admin can hand off")),
        ChatStatus::Closed => Err(ChatError::SessionClosed),
        from => Err(ChatError::InvalidTransition {
            from,
            to: ChatStatus::Active,
        }),
    }
}

/// `active -> closed` by the assigned admin. Closing twice is a no-op.
pub fn try_close(
    conn: &Connection,
    session_id: &str,
    admin_id: &str,
    now: i64,
) -> Result<Transition<ChatSession>, ChatError> {
    let changed = conn.execute(
        "UPDATE chat_sessions SET status = 'closed', closed_at = ?3, updated_at = ?3
         WHERE id = ?1 AND status = 'active' AND assigned_admin_id = ?2",
        params![session_id, admin_id, now],
    )?;

    let session = require_session(conn, session_id)?;
    if changed == 1 {
        return Ok(Transition::Applied(session));
    }
    match session.status {
        ChatStatus::Closed => Ok(Transition::Unchanged(session)),
        ChatStatus::Active => Err(ChatError::Forbidden("only the assigned admin can close")),
        from => Err(ChatError::InvalidTransition {
            from,
            to: ChatStatus::Closed,
        }),
    }
}

/// `active -> closed` by the system, only if no message arrived after
/// `idle_since`. Returns the session if this call closed it.
pub fn try_close_idle(
    conn: &Connection,
    session_id: &str,
    idle_since: i64,
    now: i64,
) -> rusqlite::Result<Option<ChatSession>> {
    let changed = conn.execute(
        "UPDATE chat_sessions SET status = 'closed', closed_at = ?3, updated_at = ?3
         WHERE id = ?1 AND status = 'active' AND last_message_at <= ?2",
        params![session_id, idle_since, now],
    )?;
    if changed == 1 {
        get_session(conn, session_id)
    } else {
        Ok(None)
    }
}

/// Active sessions with no message since `idle_since`.
pub fn list_idle_active(conn: &Connection, idle_since: i64) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM chat_sessions
         WHERE status = 'active' AND last_message_at <= ?1
         ORDER BY last_message_at ASC",
    )?;
    let ids = stmt
        .query_map(params![idle_since], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(ids)
}

/// Count one unanswered bot turn. Returns the new streak.
pub fn record_bot_miss(conn: &Connection, session_id: &str) -> rusqlite::Result<u32> {
    conn.query_row(
        "UPDATE chat_sessions SET bot_misses = bot_misses + 1 WHERE id = ?1
         RETURNING bot_misses",
        params![session_id],
        |row| row.get(0),
    )
}

pub fn reset_bot_misses(conn: &Connection, session_id: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE chat_sessions SET bot_misses = 0 WHERE id = ?1",
        params![session_id],
    )?;
    Ok(())
}
