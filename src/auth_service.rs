//! Registration, login, refresh, and logout — the operations behind the
//! `/auth/*` REST surface. Sits above [`crate::store`] and [`crate::token`]
//! so handlers stay thin.

use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

use crate::crypto::{hash_password, verify_password};
use crate::error::CoreError;
use crate::models::User;
use crate::store::{self, DbPool};
use crate::token::{generate_refresh_token, hash_refresh_token, TokenService};

static USERNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]{2,31}$").unwrap());
static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap());

pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
}

/// Username: starts with a letter, 3-32 chars, alnum + underscore.
pub fn validate_username(username: &str) -> Result<(), CoreError> {
    if !USERNAME_RE.is_match(username) {
        return Err(CoreError::Validation(
            "username must start with a letter and be 3-32 alphanumeric/underscore characters"
                .into(),
        ));
    }
    Ok(())
}

pub fn validate_email(email: &str) -> Result<(), CoreError> {
    if !EMAIL_RE.is_match(email) {
        return Err(CoreError::Validation("invalid email address".into()));
    }
    Ok(())
}

/// Password: length >= 8 AND contains upper, lower, and digit.
pub fn validate_password(password: &str) -> Result<(), CoreError> {
    if password.len() < 8 {
        return Err(CoreError::Validation(
            "password must be at least 8 characters".into(),
        ));
    }
    let has_upper = password.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = password.chars().any(|c| c.is_ascii_lowercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    if !(has_upper && has_lower && has_digit) {
        return Err(CoreError::Validation(
            "password must contain an uppercase letter, a lowercase letter, and a digit".into(),
        ));
    }
    Ok(())
}

pub async fn register(
    pool: &DbPool,
    tokens: &TokenService,
    username: &str,
    email: &str,
    password: &str,
) -> Result<(User, TokenPair), CoreError> {
    validate_username(username)?;
    validate_email(email)?;
    validate_password(password)?;

    if store::get_user_by_username_or_email(pool, username)
        .await?
        .is_some()
    {
        return Err(CoreError::AlreadyExists("username taken".into()));
    }
    if store::get_user_by_username_or_email(pool, email)
        .await?
        .is_some()
    {
        return Err(CoreError::AlreadyExists("email already registered".into()));
    }

    let password_hash = hash_password(password).map_err(CoreError::Internal)?;
    let user = store::create_user(pool, username, email, &password_hash).await?;
    let pair = issue_token_pair(pool, tokens, &user).await?;

    Ok((user, pair))
}

pub async fn login(
    pool: &DbPool,
    tokens: &TokenService,
    username_or_email: &str,
    password: &str,
) -> Result<(User, TokenPair), CoreError> {
    let user = store::get_user_by_username_or_email(pool, username_or_email)
        .await?
        .ok_or(CoreError::InvalidCredential)?;

    if !verify_password(password, &user.password_hash) {
        return Err(CoreError::InvalidCredential);
    }

    let pair = issue_token_pair(pool, tokens, &user).await?;
    Ok((user, pair))
}

/// Atomically revoke the presented refresh token and issue its replacement.
pub async fn refresh(
    pool: &DbPool,
    tokens: &TokenService,
    presented_refresh_token: &str,
) -> Result<TokenPair, CoreError> {
    let hash = hash_refresh_token(presented_refresh_token);
    let credential = store::get_refresh_credential_by_hash(pool, &hash)
        .await?
        .ok_or(CoreError::InvalidCredential)?;

    let now = chrono::Utc::now();
    if !credential.is_active(now) {
        return Err(CoreError::TokenRevoked);
    }

    let user = store::get_user_by_id(pool, credential.user_id).await?;
    let issued = generate_refresh_token();
    let new_credential_id =
        store::rotate_refresh_credential(pool, credential.id, user.id, &issued.hash, issued.expires_at)
            .await?;
    let _ = new_credential_id;

    let (access_token, _expiry) = tokens.issue_access_token(user.id, &user.username)?;

    Ok(TokenPair {
        access_token,
        refresh_token: issued.raw,
        expires_in: tokens.access_token_ttl_seconds(),
    })
}

/// Revoke the presented refresh credential.
pub async fn logout(pool: &DbPool, presented_refresh_token: &str) -> Result<(), CoreError> {
    let hash = hash_refresh_token(presented_refresh_token);
    store::revoke_refresh_credential_by_hash(pool, &hash).await
}

/// Revoke every refresh credential belonging to a user ("logout everywhere").
pub async fn logout_everywhere(pool: &DbPool, user_id: Uuid) -> Result<(), CoreError> {
    store::revoke_all_refresh_credentials(pool, user_id).await
}

/// Federated-identity callback path (spec §6): find-or-create the user for
/// this `(provider, provider_user_id)` pair and issue the same token pair a
/// password login would. `needs_username` is true when a throwaway username
/// was generated and the client should prompt the user to pick a real one.
pub async fn login_or_create_federated(
    pool: &DbPool,
    tokens: &TokenService,
    provider: &str,
    provider_user_id: &str,
    suggested_email: &str,
) -> Result<(User, TokenPair, bool), CoreError> {
    if let Some(user) = store::get_user_by_federated_identity(pool, provider, provider_user_id).await? {
        let pair = issue_token_pair(pool, tokens, &user).await?;
        return Ok((user, pair, false));
    }

    let username = format!("user_{}", Uuid::new_v4().simple());
    let user =
        store::create_federated_user(pool, &username, suggested_email, provider, provider_user_id)
            .await?;
    let pair = issue_token_pair(pool, tokens, &user).await?;
    Ok((user, pair, true))
}

async fn issue_token_pair(
    pool: &DbPool,
    tokens: &TokenService,
    user: &User,
) -> Result<TokenPair, CoreError> {
    let issued = generate_refresh_token();
    store::create_refresh_credential(pool, user.id, &issued.hash, issued.expires_at).await?;
    let (access_token, _expiry) = tokens.issue_access_token(user.id, &user.username)?;

    Ok(TokenPair {
        access_token,
        refresh_token: issued.raw,
        expires_in: tokens.access_token_ttl_seconds(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_short_password() {
        assert!(validate_password("Ab1").is_err());
    }

    #[test]
    fn rejects_password_missing_digit() {
        assert!(validate_password("Abcdefgh").is_err());
    }

    #[test]
    fn accepts_valid_password() {
        assert!(validate_password("Abcdefg1").is_ok());
    }

    #[test]
    fn rejects_username_starting_with_digit() {
        assert!(validate_username("1abc").is_err());
    }

    #[test]
    fn accepts_valid_username() {
        assert!(validate_username("alice_99").is_ok());
    }

    #[test]
    fn rejects_malformed_email() {
        assert!(validate_email("not-an-email").is_err());
    }
}
