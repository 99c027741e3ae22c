pub mod migrations;
pub mod models;

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// The authoritative store for ride requests and chat sessions. Callers
/// lock it inside `spawn_blocking`; a conditional UPDATE run under the lock
/// is one compare-and-swap.
pub type DbPool = Arc<Mutex<Connection>>;

/// Open `<data_dir>/rideline.db` in WAL mode and migrate it.
pub fn init_db(data_dir: &str) -> Result<DbPool, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(data_dir)?;

    let db_path = Path::new(data_dir).join("rideline.db");
    let mut conn = Connection::open(&db_path)?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    migrations::migrations().to_latest(&mut conn)?;

    tracing::info!("Database initialized at {}", db_path.display());

    Ok(Arc::new(Mutex::new(conn)))
}

/// Outcome of a compare-and-swap that may already have been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition<T> {
    /// This call moved the entity.
    Applied(T),
    /// The entity was already in the requested state; nothing changed.
    Unchanged(T),
}

impl<T> Transition<T> {
    pub fn get(&self) -> &T {
        match self {
            Self::Applied(v) | Self::Unchanged(v) => v,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            Self::Applied(v) | Self::Unchanged(v) => v,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Open a migrated in-memory database. Used by unit tests.
pub fn init_memory_db() -> Result<DbPool, Box<dyn std::error::Error>> {
    let mut conn = Connection::open_in_memory()?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    migrations::migrations().to_latest(&mut conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_valid() {
        assert!(migrations::migrations().validate().is_ok());
    }

    #[test]
    fn file_database_is_created_in_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("nested");
        let data_dir = data_dir.to_str().unwrap();
        init_db(data_dir).unwrap();
        assert!(Path::new(data_dir).join("rideline.db").exists());
    }
}
