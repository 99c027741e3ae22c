use axum::{extract::FromRequestParts, http::request::Parts};
use serde::{Deserialize, Serialize};

use crate::auth::Role;
use crate::error::ApiError;

/// Bearer token claims. Used directly as a handler argument; a request
/// without a valid token never reaches the handler body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Participant id: customer, driver or admin.
    pub sub: String,
    pub name: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

impl Claims {
    pub fn ensure_admin(&self) -> Result<(), ApiError> {
        match self.role {
            Role::Admin => Ok(()),
            _ => Err(ApiError::Forbidden("admin role required")),
        }
    }
}

impl<S> FromRequestParts<S> for Claims
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(ApiError::MissingToken)?;

        let secret = parts
            .extensions
            .get::<JwtSecret>()
            .ok_or_else(|| ApiError::Internal("signing key not installed".into()))?;

        crate::auth::jwt::validate_access_token(&secret.0, token)
    }
}

/// Signing key placed in request extensions by `inject_jwt_secret`.
#[derive(Clone)]
pub struct JwtSecret(pub Vec<u8>);
