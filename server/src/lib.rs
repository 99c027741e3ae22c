//! Rideline coordination server library.
//! This crate exposes internal modules for integration testing and for the
//! Rust client in `client`. The binary entry point is in main.rs.

pub mod activity;
pub mod auth;
pub mod chat;
pub mod client;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod presence;
pub mod routes;
pub mod state;
pub mod ws;

/// Current wall-clock time in Unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
