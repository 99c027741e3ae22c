//! Rust client for the coordination server.
//!
//! - [`connection`]: one persistent socket with bounded linear-backoff
//!   reconnect and typed pub/sub.
//! - [`api`]: REST calls, the authoritative snapshots.
//! - [`reconcile`]: merges socket events with REST snapshots.
//! - [`live`]: wires the three together for a console.

pub mod api;
pub mod connection;
pub mod live;
pub mod reconcile;

use std::time::Duration;

use crate::error::ErrorCategory;

pub use api::ApiClient;
pub use connection::{Connection, ConnectionManager, Lifecycle, Subscription};
pub use live::{Audience, LiveView};
pub use reconcile::{ConsistentView, Reconciler};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// e.g. `http://127.0.0.1:8420`
    pub base_url: String,
    /// Attempt `k` of a reconnect waits `k * backoff_step`.
    pub backoff_step: Duration,
    pub max_reconnect_attempts: u32,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            backoff_step: Duration::from_secs(1),
            max_reconnect_attempts: 5,
        }
    }

    /// Socket endpoint derived from the HTTP base.
    pub fn ws_url(&self) -> String {
        let rest = self
            .base_url
            .strip_prefix("https://")
            .map(|r| format!("wss://{}", r))
            .or_else(|| {
                self.base_url
                    .strip_prefix("http://")
                    .map(|r| format!("ws://{}", r))
            })
            .unwrap_or_else(|| self.base_url.clone());
        format!("{}/ws", rest)
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,

    #[error("gave up after {attempts} connection attempts")]
    RetriesExhausted { attempts: u32 },

    /// The server closed the socket during authentication (4001/4002).
    #[error("connection rejected ({code}): {reason}")]
    Rejected { code: u16, reason: String },

    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Typed error body returned by the server.
    #[error("{message}")]
    Api {
        status: u16,
        category: ErrorCategory,
        code: String,
        message: String,
    },

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ClientError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotConnected
            | Self::RetriesExhausted { .. }
            | Self::Transport(_)
            | Self::Http(_) => ErrorCategory::Connectivity,
            Self::Rejected { .. } => ErrorCategory::Authorization,
            Self::Api { category, .. } => *category,
            Self::Decode(_) => ErrorCategory::Internal,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Self::NotConnected => "not_connected",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Rejected { .. } => "rejected",
            Self::Transport(_) => "transport",
            Self::Http(_) => "http",
            Self::Api { code, .. } => code,
            Self::Decode(_) => "decode",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_url_follows_scheme() {
        assert_eq!(
            ClientConfig::new("http://127.0.0.1:8420/").ws_url(),
            "ws://127.0.0.1:8420/ws"
        );
        assert_eq!(
            ClientConfig::new("https://rides.example").ws_url(),
            "wss://rides.example/ws"
        );
    }

    #[test]
    fn backoff_is_linear() {
        let config = ClientConfig::new("http://localhost");
        assert_eq!(config.backoff(1), Duration::from_secs(1));
        assert_eq!(config.backoff(3), Duration::from_secs(3));
    }

    #[test]
    fn server_categories_pass_through() {
        let err = ClientError::Api {
            status: 409,
            category: ErrorCategory::Contention,
            code: "already_assigned".into(),
            message: "ride request already assigned to another driver".into(),
        };
        assert_eq!(err.category(), ErrorCategory::Contention);
        assert_eq!(err.code(), "already_assigned");
        assert_eq!(ClientError::NotConnected.category(), ErrorCategory::Connectivity);
    }
}
