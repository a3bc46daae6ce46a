//! `/users/*` handlers: the caller's own profile and username/display-name
//! search (spec §3 "mutated by profile updates"; spec §6 lists user search
//! among the few REST routes that don't require a bearer token).

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::auth::AuthUser;
use crate::error::CoreError;
use crate::models::User;
use crate::store::{self, DbPool, PublicProfile};

pub async fn me(State(pool): State<DbPool>, user: AuthUser) -> Result<Json<User>, CoreError> {
    let record = store::get_user_by_id(&pool, user.user_id).await?;
    Ok(Json(record))
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateProfileRequest {
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub show_online_status: Option<bool>,
    pub read_receipts_enabled: Option<bool>,
}

pub async fn update_profile(
    State(pool): State<DbPool>,
    user: AuthUser,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<Json<User>, CoreError> {
    let updated = store::update_user_profile(
        &pool,
        user.user_id,
        req.display_name.as_deref(),
        req.avatar_url.as_deref(),
        req.show_online_status,
        req.read_receipts_enabled,
    )
    .await?;
    Ok(Json(updated))
}

#[derive(Debug, Deserialize)]
pub struct SearchUsersQuery {
    pub q: String,
    pub limit: Option<i64>,
}

/// Unauthenticated by design (spec §6): a client needs to find a user to
/// start a conversation with before it has proven it is one.
pub async fn search_users(
    State(pool): State<DbPool>,
    Query(q): Query<SearchUsersQuery>,
) -> Result<Json<Vec<PublicProfile>>, CoreError> {
    let users = store::search_users(&pool, &q.q, q.limit).await?;
    Ok(Json(users))
}
