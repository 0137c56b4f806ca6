//! JWT access tokens: HMAC-signed, subject is the admin id.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::AuthConfig;
use crate::error::{AppError, Result};

fn algorithm(auth: &AuthConfig) -> Result<Algorithm> {
    match auth.jwt_algorithm.as_str() {
        "HS256" => Ok(Algorithm::HS256),
        "HS384" => Ok(Algorithm::HS384),
        "HS512" => Ok(Algorithm::HS512),
        other => Err(AppError::config(format!("unsupported JWT_ALGORITHM: {other}"))),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    /// Admin id, as a string (JWT `sub` is conventionally a string).
    sub: String,
    exp: i64,
    iat: i64,
}

/// Encodes an access token for `admin_id`, valid for the configured TTL.
pub fn encode_token(admin_id: i64, auth: &AuthConfig) -> Result<String> {
    let now = Utc::now();
    let claims = Claims {
        sub: admin_id.to_string(),
        iat: now.timestamp(),
        exp: (now + Duration::minutes(auth.access_token_expire_minutes)).timestamp(),
    };

    encode(
        &Header::new(algorithm(auth)?),
        &claims,
        &EncodingKey::from_secret(auth.jwt_secret.as_bytes()),
    )
    .map_err(|e| AppError::auth(format!("failed to sign access token: {e}")))
}

/// Decodes and validates an access token, returning the admin id on success.
///
/// Tolerant of any failure mode (expired, malformed, wrong signature, or a
/// misconfigured `JWT_ALGORITHM`): all collapse to `None` so callers don't
/// need to distinguish them for a 401.
pub fn decode_token(token: &str, auth: &AuthConfig) -> Option<i64> {
    let validation = Validation::new(algorithm(auth).ok()?);
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(auth.jwt_secret.as_bytes()),
        &validation,
    )
    .ok()?;
    data.claims.sub.parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_config() -> AuthConfig {
        AuthConfig {
            jwt_secret: "test-secret".to_string(),
            jwt_algorithm: "HS256".to_string(),
            access_token_expire_minutes: 120,
        }
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let auth = auth_config();
        let token = encode_token(42, &auth).unwrap();
        assert_eq!(decode_token(&token, &auth), Some(42));
    }

    #[test]
    fn test_decode_rejects_wrong_secret() {
        let auth = auth_config();
        let token = encode_token(42, &auth).unwrap();

        let mut other = auth_config();
        other.jwt_secret = "different-secret".to_string();
        assert_eq!(decode_token(&token, &other), None);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let auth = auth_config();
        assert_eq!(decode_token("not.a.jwt", &auth), None);
    }

    #[test]
    fn test_decode_rejects_expired_token() {
        let mut auth = auth_config();
        auth.access_token_expire_minutes = -1;
        let token = encode_token(42, &auth).unwrap();
        assert_eq!(decode_token(&token, &auth), None);
    }

    #[test]
    fn test_encode_respects_configured_algorithm() {
        let mut auth = auth_config();
        auth.jwt_algorithm = "HS512".to_string();
        let token = encode_token(42, &auth).unwrap();
        assert_eq!(decode_token(&token, &auth), Some(42));

        let mut hs256 = auth_config();
        hs256.jwt_algorithm = "HS256".to_string();
        assert_eq!(decode_token(&token, &hs256), None);
    }

    #[test]
    fn test_unsupported_algorithm_is_config_error() {
        let mut auth = auth_config();
        auth.jwt_algorithm = "RS256".to_string();
        assert!(encode_token(42, &auth).is_err());
        assert_eq!(decode_token("anything", &auth), None);
    }
}
