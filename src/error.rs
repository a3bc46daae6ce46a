//! Shared error taxonomy for Store, TokenService, AuthService, and Hub.
//!
//! REST handlers translate a `CoreError` into an HTTP status via
//! [`IntoResponse`]; the socket dispatcher instead maps it to a structured
//! `error` envelope via [`CoreError::socket_code`].

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not authenticated")]
    Unauthenticated,

    #[error("invalid credential")]
    InvalidCredential,

    #[error("credential expired")]
    TokenExpired,

    #[error("credential revoked")]
    TokenRevoked,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not a member of this conversation")]
    NotMember,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("temporarily unavailable: {0}")]
    TransientUnavailable(String),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated
            | Self::InvalidCredential
            | Self::TokenExpired
            | Self::TokenRevoked => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) | Self::NotMember => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) | Self::AlreadyExists(_) => StatusCode::CONFLICT,
            Self::TransientUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_name(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::Unauthenticated => "Unauthenticated",
            Self::InvalidCredential => "InvalidCredential",
            Self::TokenExpired => "TokenExpired",
            Self::TokenRevoked => "TokenRevoked",
            Self::Forbidden(_) => "Forbidden",
            Self::NotMember => "NotMember",
            Self::NotFound(_) => "NotFound",
            Self::AlreadyExists(_) => "AlreadyExists",
            Self::Conflict(_) => "Conflict",
            Self::TransientUnavailable(_) => "TransientUnavailable",
            Self::Internal(_) => "InternalError",
        }
    }

    /// The `error.code` carried in a socket `error` envelope.
    pub fn socket_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid_message",
            Self::Unauthenticated
            | Self::InvalidCredential
            | Self::TokenExpired
            | Self::TokenRevoked => "not_authenticated",
            Self::Forbidden(_) | Self::NotMember => "not_member",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) | Self::AlreadyExists(_) => "conflict",
            Self::TransientUnavailable(_) => "unavailable",
            Self::Internal(_) => "save_failed",
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => CoreError::NotFound("row not found".into()),
            sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505") => {
                CoreError::AlreadyExists(db_err.message().to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                CoreError::TransientUnavailable(err.to_string())
            }
            _ => CoreError::Internal(anyhow::anyhow!(err)),
        }
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_name = self.error_name();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, error_name, "internal error");
        } else {
            tracing::debug!(error = %self, error_name, "request failed");
        }
        (
            status,
            Json(json!({ "error": error_name, "message": self.to_string() })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_not_member_to_forbidden() {
        assert_eq!(CoreError::NotMember.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(CoreError::NotMember.socket_code(), "not_member");
    }

    #[test]
    fn maps_already_exists_to_conflict() {
        let err = CoreError::AlreadyExists("conversation".into());
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.socket_code(), "conflict");
    }

    #[test]
    fn maps_token_expired_to_unauthorized() {
        assert_eq!(
            CoreError::TokenExpired.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(CoreError::TokenExpired.socket_code(), "not_authenticated");
    }

    #[test]
    fn validation_maps_to_bad_request() {
        let err = CoreError::Validation("body must not be empty".into());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.socket_code(), "invalid_message");
    }
}
