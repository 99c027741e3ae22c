//! Support chat: session lifecycle, bot turns, typing indicators.
//!
//! `bot -> waiting -> active -> closed`. The `waiting -> active` step is an
//! acceptance race among admins resolved by the store's compare-and-swap.

pub mod bot;
pub mod broadcast;
pub mod idle;
pub mod routes;
pub mod session;
pub mod store;
pub mod typing;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::auth::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatStatus {
    /// Automated responses only.
    Bot,
    /// Escalated, no admin assigned.
    Waiting,
    /// One admin assigned, live messaging.
    Active,
    /// Terminal.
    Closed,
}

impl ChatStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bot => "bot",
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bot" => Some(Self::Bot),
            "waiting" => Some(Self::Waiting),
            "active" => Some(Self::Active),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }

    /// Allowed lifecycle edges. `active -> active` is the explicit hand-off.
    pub fn can_transition_to(&self, next: ChatStatus) -> bool {
        matches!(
            (self, next),
            (Self::Bot, Self::Waiting)
                | (Self::Waiting, Self::Active)
                | (Self::Active, Self::Active)
                | (Self::Active, Self::Closed)
        )
    }

    pub fn accepts_messages(&self) -> bool {
        !matches!(self, Self::Closed)
    }
}

impl fmt::Display for ChatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for ChatStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ChatStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let s = value.as_str()?;
        Self::parse(s).ok_or_else(|| FromSqlError::Other(format!("unknown chat status {s}").into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    User,
    Bot,
    Admin,
}

impl SenderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Bot => "bot",
            Self::Admin => "admin",
        }
    }

    /// The sender role a participant is allowed to post as.
    pub fn for_role(role: Role) -> Option<Self> {
        match role {
            Role::Customer => Some(Self::User),
            Role::Admin => Some(Self::Admin),
            Role::Driver => None,
        }
    }
}

impl ToSql for SenderRole {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for SenderRole {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "user" => Ok(Self::User),
            "bot" => Ok(Self::Bot),
            "admin" => Ok(Self::Admin),
            other => Err(FromSqlError::Other(format!("unknown sender role {other}").into())),
        }
    }
}

/// Append-only chat line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Store sequence; doubles as arrival order.
    pub id: i64,
    pub session_id: String,
    pub sender_role: SenderRole,
    #[serde(default)]
    pub sender_id: Option<String>,
    pub text: String,
    pub created_at: i64,
}

impl ChatMessage {
    /// Identity used to deduplicate the same line seen over socket and REST.
    pub fn identity(&self) -> (SenderRole, &str, i64) {
        (self.sender_role, self.text.as_str(), self.created_at)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub customer_id: String,
    pub customer_name: String,
    pub status: ChatStatus,
    pub assigned_admin_id: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_message_at: i64,
    pub closed_at: Option<i64>,
}
