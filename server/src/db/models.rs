//! Row types for the tables that have no richer domain model.
//! Ride requests and chat sessions live in `dispatch` and `chat`.

use serde::{Deserialize, Serialize};

/// Driver record in the drivers table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Driver {
    pub id: String,
    pub display_name: String,
    pub license_verified: bool,
    pub updated_at: i64,
}

impl Driver {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            display_name: row.get(1)?,
            license_verified: row.get(2)?,
            updated_at: row.get(3)?,
        })
    }
}

/// Activity log entry in the activity_logs table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityLog {
    pub id: i64,
    pub actor_id: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub details: String,
    pub created_at: i64,
}

impl ActivityLog {
    pub(crate) fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            actor_id: row.get(1)?,
            action: row.get(2)?,
            entity_type: row.get(3)?,
            entity_id: row.get(4)?,
            details: row.get(5)?,
            created_at: row.get(6)?,
        })
    }
}
