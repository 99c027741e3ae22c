use rusqlite_migration::{Migrations, M};

/// Define all schema migrations.
/// Versions are tracked in SQLite's user_version pragma.
/// Timestamps are Unix milliseconds unless the column name says otherwise.
pub fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            "-- Migration 1: Dispatch

CREATE TABLE drivers (
    id TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    license_verified INTEGER NOT NULL DEFAULT 0,
    updated_at INTEGER NOT NULL
);

CREATE TABLE ride_requests (
    id TEXT PRIMARY KEY,
    booking_id TEXT NOT NULL,
    customer_id TEXT NOT NULL,
    car TEXT NOT NULL,
    pickup_location TEXT NOT NULL,
    pickup_at TEXT NOT NULL,
    return_at TEXT NOT NULL,
    price TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'open',
    accepted_driver_id TEXT,
    created_at INTEGER NOT NULL,
    closed_at INTEGER
);

CREATE INDEX idx_ride_requests_booking ON ride_requests(booking_id);
CREATE INDEX idx_ride_requests_status ON ride_requests(status, created_at);
-- At most one open dispatch per booking
CREATE UNIQUE INDEX idx_ride_requests_open_booking
    ON ride_requests(booking_id) WHERE status = 'open';

CREATE TABLE ride_candidates (
    request_id TEXT NOT NULL,
    driver_id TEXT NOT NULL,
    notified_at INTEGER NOT NULL,
    declined INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (request_id, driver_id),
    FOREIGN KEY (request_id) REFERENCES ride_requests(id)
);
",
        ),
        M::up(
            "-- Migration 2: Support chat and activity log

CREATE TABLE chat_sessions (
    id TEXT PRIMARY KEY,
    customer_id TEXT NOT NULL,
    customer_name TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'bot',
    assigned_admin_id TEXT,
    bot_misses INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    last_message_at INTEGER NOT NULL,
    closed_at INTEGER
);

CREATE INDEX idx_chat_sessions_customer ON chat_sessions(customer_id, status);
CREATE INDEX idx_chat_sessions_status ON chat_sessions(status, last_message_at);

-- id doubles as arrival order for timestamp ties
CREATE TABLE chat_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    sender_role TEXT NOT NULL,
    sender_id TEXT,
    text TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    FOREIGN KEY (session_id) REFERENCES chat_sessions(id)
);

CREATE INDEX idx_chat_messages_session ON chat_messages(session_id, created_at, id);

CREATE TABLE activity_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    actor_id TEXT NOT NULL,
    action TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    details TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL
);

CREATE INDEX idx_activity_logs_created ON activity_logs(created_at);
",
        ),
    ])
}
