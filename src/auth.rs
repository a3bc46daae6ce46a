use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use parking_lot::RwLock;
use serde_json::json;
use std::{collections::HashMap, num::NonZeroU32, sync::Arc};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::token::TokenService;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing authorization header")]
    MissingAuthHeader,

    #[error("Invalid authorization header format")]
    InvalidAuthFormat,

    #[error("Invalid JWT token: {0}")]
    InvalidToken(String),

    #[error("Token has expired")]
    TokenExpired,

    #[error("Rate limit exceeded")]
    RateLimitExceeded,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = match self {
            AuthError::MissingAuthHeader
            | AuthError::InvalidAuthFormat
            | AuthError::InvalidToken(_)
            | AuthError::TokenExpired => StatusCode::UNAUTHORIZED,
            AuthError::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Authenticated identity extracted from a request's access token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub username: String,
}

/// Per-user request-rate limiting, keyed by authenticated user id.
///
/// Shared across requests via `AppState`/`FromRef` rather than constructed
/// per-request, so the limiter state (and therefore the rate limit itself)
/// is actually enforced rather than reset on every call.
#[derive(Clone)]
pub struct AuthMiddleware {
    rate_limiters: Arc<RwLock<HashMap<Uuid, Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>>>>,
    rate_limit_quota: Quota,
}

impl AuthMiddleware {
    pub fn new() -> Self {
        Self::with_config(100, 60)
    }

    pub fn with_config(rate_limit_requests: u32, _period_seconds: u64) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(rate_limit_requests.max(1)).unwrap())
            .allow_burst(NonZeroU32::new((rate_limit_requests.max(1) / 10).max(1)).unwrap());

        Self {
            rate_limiters: Arc::new(RwLock::new(HashMap::new())),
            rate_limit_quota: quota,
        }
    }

    pub fn check_rate_limit(&self, user_id: Uuid) -> Result<(), AuthError> {
        let mut limiters = self.rate_limiters.write();

        let limiter = limiters
            .entry(user_id)
            .or_insert_with(|| Arc::new(RateLimiter::direct(self.rate_limit_quota)))
            .clone();

        drop(limiters);

        limiter.check().map_err(|_| AuthError::RateLimitExceeded)
    }
}

impl Default for AuthMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    TokenService: FromRef<S>,
    AuthMiddleware: FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or(AuthError::MissingAuthHeader)?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or(AuthError::InvalidAuthFormat)?;

        let token_service = TokenService::from_ref(state);
        let claims = token_service
            .verify_access_token(token)
            .map_err(|e| match e {
                crate::error::CoreError::TokenExpired => AuthError::TokenExpired,
                other => AuthError::InvalidToken(other.to_string()),
            })?;

        let auth_middleware = AuthMiddleware::from_ref(state);
        auth_middleware.check_rate_limit(claims.sub)?;

        debug!(user_id = %claims.sub, "authenticated request");

        Ok(AuthUser {
            user_id: claims.sub,
            username: claims.username,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_allows_first_request_per_user() {
        let middleware = AuthMiddleware::with_config(10, 1);
        assert!(middleware.check_rate_limit(Uuid::new_v4()).is_ok());
    }
}
