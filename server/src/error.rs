//! Error taxonomy shared by the dispatch and chat subsystems.
//!
//! Every error maps to an [`ErrorCategory`] that decides how it is surfaced:
//! contention and temporal errors are informational for the UI, authorization
//! errors reject a single attempt, internal errors are logged.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::chat::ChatStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Another participant won a race. Expected under normal load.
    Contention,
    /// The entity is no longer available (expired, cancelled, closed).
    Temporal,
    /// Socket or transport failure.
    Connectivity,
    Authorization,
    Invalid,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("ride request not found")]
    NotFound,

    #[error("ride request already assigned to another driver")]
    AlreadyAssigned,

    #[error("ride request expired")]
    Expired,

    #[error("ride request cancelled")]
    Cancelled,

    #[error("driver is not license-verified")]
    NotEligible,

    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::AlreadyAssigned => ErrorCategory::Contention,
            Self::Expired | Self::Cancelled => ErrorCategory::Temporal,
            Self::NotEligible | Self::Forbidden(_) => ErrorCategory::Authorization,
            Self::NotFound | Self::Invalid(_) => ErrorCategory::Invalid,
            Self::Storage(_) | Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::AlreadyAssigned => "already_assigned",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
            Self::NotEligible => "not_eligible",
            Self::Forbidden(_) => "forbidden",
            Self::Invalid(_) => "invalid",
            Self::Storage(_) | Self::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::AlreadyAssigned => StatusCode::CONFLICT,
            Self::Expired | Self::Cancelled => StatusCode::GONE,
            Self::NotEligible | Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Invalid(_) => StatusCode::BAD_REQUEST,
            Self::Storage(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<tokio::task::JoinError> for DispatchError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("task join: {}", err))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("chat session not found")]
    NotFound,

    #[error("chat session already has an assigned admin")]
    SessionAlreadyActive,

    #[error("chat session is closed")]
    SessionClosed,

    #[error("cannot move chat session from {from} to {to}")]
    InvalidTransition { from: ChatStatus, to: ChatStatus },

    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::SessionAlreadyActive => ErrorCategory::Contention,
            Self::SessionClosed => ErrorCategory::Temporal,
            Self::Forbidden(_) => ErrorCategory::Authorization,
            Self::NotFound | Self::InvalidTransition { .. } | Self::Invalid(_) => {
                ErrorCategory::Invalid
            }
            Self::Storage(_) | Self::Internal(_) => ErrorCategory::Internal,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::SessionAlreadyActive => "session_already_active",
            Self::SessionClosed => "session_closed",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Forbidden(_) => "forbidden",
            Self::Invalid(_) => "invalid",
            Self::Storage(_) | Self::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::SessionAlreadyActive | Self::InvalidTransition { .. } => StatusCode::CONFLICT,
            Self::SessionClosed => StatusCode::GONE,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Invalid(_) => StatusCode::BAD_REQUEST,
            Self::Storage(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<tokio::task::JoinError> for ChatError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("task join: {}", err))
    }
}

/// Failures outside the dispatch and chat domains: authentication and the
/// admin read endpoints.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("token expired")]
    TokenExpired,

    #[error("token invalid")]
    TokenInvalid,

    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Storage(_) | Self::Internal(_) => ErrorCategory::Internal,
            _ => ErrorCategory::Authorization,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingToken => "missing_token",
            Self::TokenExpired => "token_expired",
            Self::TokenInvalid => "token_invalid",
            Self::Forbidden(_) => "forbidden",
            Self::Storage(_) | Self::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::MissingToken | Self::TokenExpired | Self::TokenInvalid => {
                StatusCode::UNAUTHORIZED
            }
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Storage(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("task join: {}", err))
    }
}

fn error_response(
    status: StatusCode,
    category: ErrorCategory,
    code: &'static str,
    message: String,
) -> Response {
    let message = if category == ErrorCategory::Internal {
        tracing::error!(code = code, "Internal error: {}", message);
        "Internal Server Error".to_string()
    } else {
        message
    };

    let body = Json(json!({
        "error": message,
        "category": category,
        "code": code,
    }));

    (status, body).into_response()
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        error_response(self.status(), self.category(), self.code(), self.to_string())
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        error_response(self.status(), self.category(), self.code(), self.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error_response(self.status(), self.category(), self.code(), self.to_string())
    }
}
