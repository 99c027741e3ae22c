use std::path::Path;

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;

use crate::auth::middleware::Claims;
use crate::auth::Role;
use crate::error::ApiError;

/// Access token lifetime. Tokens are minted by the account service that
/// shares this signing key; `issue_access_token` exists for it and for tests.
pub const ACCESS_TOKEN_TTL_SECS: i64 = 12 * 3600;

/// Load or generate the JWT signing key (256-bit random secret).
/// Key is stored as raw bytes in data_dir/jwt_secret.
pub fn load_or_generate_jwt_secret(data_dir: &str) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    std::fs::create_dir_all(data_dir)?;
    let key_path = Path::new(data_dir).join("jwt_secret");

    if key_path.exists() {
        let key = std::fs::read(&key_path)?;
        if key.len() == 32 {
            tracing::info!("JWT signing key loaded from {}", key_path.display());
            return Ok(key);
        }
        tracing::warn!("JWT key file has wrong size ({}), regenerating", key.len());
    }

    let key: [u8; 32] = rand::rng().random();
    std::fs::write(&key_path, key)?;
    tracing::info!("JWT signing key generated at {}", key_path.display());
    Ok(key.to_vec())
}

/// Issue an access token.
/// Claims: sub=user_id, name, role, iat, exp
pub fn issue_access_token(
    secret: &[u8],
    user_id: &str,
    name: &str,
    role: Role,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user_id.to_string(),
        name: name.to_string(),
        role,
        iat: now,
        exp: now + ACCESS_TOKEN_TTL_SECS,
    };

    encode(
        &Header::default(), // HS256
        &claims,
        &EncodingKey::from_secret(secret),
    )
}

/// Validate an access token and return its claims. Expiry is reported
/// apart from every other failure so sockets can pick the close code.
pub fn validate_access_token(secret: &[u8], token: &str) -> Result<Claims, ApiError> {
    let validation = Validation::new(jsonwebtoken::Algorithm::HS256);
    decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => ApiError::TokenExpired,
            _ => ApiError::TokenInvalid,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_round_trips_role() {
        let secret = [7u8; 32];
        let token = issue_access_token(&secret, "drv-1", "Dana", Role::Driver).unwrap();
        let claims = validate_access_token(&secret, &token).unwrap();
        assert_eq!(claims.sub, "drv-1");
        assert_eq!(claims.role, Role::Driver);
    }

    #[test]
    fn token_signed_with_other_key_is_rejected() {
        let token = issue_access_token(&[1u8; 32], "adm-1", "Ari", Role::Admin).unwrap();
        assert!(matches!(
            validate_access_token(&[2u8; 32], &token),
            Err(ApiError::TokenInvalid)
        ));
    }

    #[test]
    fn lapsed_token_reports_expiry() {
        let secret = [3u8; 32];
        let past = Utc::now().timestamp() - 3600;
        let claims = Claims {
            sub: "cust-1".into(),
            name: "Cleo".into(),
            role: Role::Customer,
            iat: past - ACCESS_TOKEN_TTL_SECS,
            exp: past,
        };
        let key = EncodingKey::from_secret(&secret);
        let token = encode(&Header::default(), &claims, &key).unwrap();
        assert!(matches!(
            validate_access_token(&secret, &token),
            Err(ApiError::TokenExpired)
        ));
    }

    #[test]
    fn secret_is_persisted_between_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_str().unwrap();
        let first = load_or_generate_jwt_secret(path).unwrap();
        let second = load_or_generate_jwt_secret(path).unwrap();
        assert_eq!(first.len(), 32);
        assert_eq!(first, second);
    }
}
