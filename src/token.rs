//! Access/refresh token issuance and verification.
//!
//! Access credentials are signed HS256 JWTs with a short TTL. Refresh
//! credentials are opaque random strings; only their SHA-256 hash is ever
//! persisted (see [`crate::store::create_user`] callers in
//! [`crate::auth_service`]), so a leaked database dump does not hand out
//! usable refresh tokens.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::sha256_hex;
use crate::error::CoreError;

const ACCESS_TOKEN_TTL_MINUTES: i64 = 15;
const REFRESH_TOKEN_TTL_DAYS: i64 = 30;
const REFRESH_TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: Uuid,
    pub username: String,
    pub exp: i64,
    pub iat: i64,
}

#[derive(Clone)]
pub struct TokenService {
    secret: Vec<u8>,
}

impl TokenService {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let secret = std::env::var("JWT_SECRET")
            .map_err(|_| anyhow::anyhow!("JWT_SECRET must be set"))?;
        Ok(Self::new(secret.into_bytes()))
    }

    /// Mint a signed access token good for ~15 minutes. Returns the token and
    /// its expiry so callers can report `expires_in` without re-decoding.
    pub fn issue_access_token(
        &self,
        user_id: Uuid,
        username: &str,
    ) -> Result<(String, DateTime<Utc>), CoreError> {
        let now = Utc::now();
        let expires_at = now + Duration::minutes(ACCESS_TOKEN_TTL_MINUTES);
        let claims = AccessClaims {
            sub: user_id,
            username: username.to_string(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
        };
        let token = encode(
            &Header::new(jsonwebtoken::Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&self.secret),
        )
        .map_err(|e| CoreError::Internal(anyhow::anyhow!(e)))?;

        Ok((token, expires_at))
    }

    pub fn verify_access_token(&self, token: &str) -> Result<AccessClaims, CoreError> {
        let mut validation = Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.validate_exp = true;
        let data = decode::<AccessClaims>(
            token,
            &DecodingKey::from_secret(&self.secret),
            &validation,
        )
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => CoreError::TokenExpired,
            _ => CoreError::InvalidCredential,
        })?;

        Ok(data.claims)
    }

    /// `ACCESS_TOKEN_TTL_MINUTES` converted to seconds, for the REST
    /// `expires_in` field.
    pub fn access_token_ttl_seconds(&self) -> i64 {
        ACCESS_TOKEN_TTL_MINUTES * 60
    }
}

/// A freshly minted refresh token: the raw opaque value (handed to the
/// client once) plus its hash and expiry (persisted by the caller).
pub struct IssuedRefreshToken {
    pub raw: String,
    pub hash: String,
    pub expires_at: DateTime<Utc>,
}

/// Generate a new high-entropy opaque refresh token and its SHA-256 hash.
pub fn generate_refresh_token() -> IssuedRefreshToken {
    let mut bytes = [0u8; REFRESH_TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let raw = base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, bytes);
    let hash = sha256_hex(raw.as_bytes());
    IssuedRefreshToken {
        raw,
        hash,
        expires_at: Utc::now() + Duration::days(REFRESH_TOKEN_TTL_DAYS),
    }
}

pub fn hash_refresh_token(raw: &str) -> String {
    sha256_hex(raw.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_token_round_trips() {
        let service = TokenService::new(b"test-secret".to_vec());
        let user_id = Uuid::new_v4();
        let (token, _expiry) = service.issue_access_token(user_id, "alice").unwrap();
        let claims = service.verify_access_token(&token).unwrap();
        assert_eq!(claims.sub, user_id);
        assert_eq!(claims.username, "alice");
    }

    #[test]
    fn tampered_secret_is_rejected() {
        let service_a = TokenService::new(b"secret-a".to_vec());
        let service_b = TokenService::new(b"secret-b".to_vec());
        let (token, _) = service_a.issue_access_token(Uuid::new_v4(), "alice").unwrap();
        assert!(matches!(
            service_b.verify_access_token(&token),
            Err(CoreError::InvalidCredential)
        ));
    }

    #[test]
    fn refresh_tokens_are_unique_and_hash_consistently() {
        let a = generate_refresh_token();
        let b = generate_refresh_token();
        assert_ne!(a.raw, b.raw);
        assert_eq!(hash_refresh_token(&a.raw), a.hash);
    }
}
