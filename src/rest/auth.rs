//! `/auth/*` handlers: registration, password login, refresh rotation,
//! logout. Thin wrappers over [`crate::auth_service`] (spec §4.3, §6).

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::auth::AuthUser;
use crate::auth_service::{self, TokenPair};
use crate::error::CoreError;
use crate::store::DbPool;
use crate::token::TokenService;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username_or_email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
pub struct LogoutRequest {
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

impl From<TokenPair> for TokenResponse {
    fn from(pair: TokenPair) -> Self {
        Self {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            expires_in: pair.expires_in,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub user_id: uuid::Uuid,
    pub username: String,
    #[serde(flatten)]
    pub tokens: TokenResponse,
}

pub async fn register(
    State(pool): State<DbPool>,
    State(tokens): State<TokenService>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<AuthResponse>, CoreError> {
    let (user, pair) =
        auth_service::register(&pool, &tokens, &req.username, &req.email, &req.password).await?;
    Ok(Json(AuthResponse {
        user_id: user.id,
        username: user.username,
        tokens: pair.into(),
    }))
}

pub async fn login(
    State(pool): State<DbPool>,
    State(tokens): State<TokenService>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, CoreError> {
    let (user, pair) =
        auth_service::login(&pool, &tokens, &req.username_or_email, &req.password).await?;
    Ok(Json(AuthResponse {
        user_id: user.id,
        username: user.username,
        tokens: pair.into(),
    }))
}

pub async fn refresh(
    State(pool): State<DbPool>,
    State(tokens): State<TokenService>,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<TokenResponse>, CoreError> {
    let pair = auth_service::refresh(&pool, &tokens, &req.refresh_token).await?;
    Ok(Json(pair.into()))
}

pub async fn logout(
    State(pool): State<DbPool>,
    Json(req): Json<LogoutRequest>,
) -> Result<(), CoreError> {
    auth_service::logout(&pool, &req.refresh_token).await
}

pub async fn logout_everywhere(
    State(pool): State<DbPool>,
    user: AuthUser,
) -> Result<(), CoreError> {
    auth_service::logout_everywhere(&pool, user.user_id).await
}
