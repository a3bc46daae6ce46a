//! Integration test for refresh-token rotation. Gated behind
//! `TEST_DATABASE_URL`, same convention as the rest of the suite.

use chatcore_server::store;
use chatcore_server::token::{generate_refresh_token, hash_refresh_token};
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

async fn test_pool() -> Option<sqlx::PgPool> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    PgPoolOptions::new().max_connections(4).connect(&url).await.ok()
}

#[tokio::test]
async fn rotating_a_refresh_token_revokes_the_old_one_and_issues_a_new_one() {
    let Some(pool) = test_pool().await else {
        return;
    };

    let user = store::create_user(
        &pool,
        &format!("rotator_{}", Uuid::new_v4().simple()),
        &format!("rotator_{}@example.com", Uuid::new_v4().simple()),
        "hash",
    )
    .await
    .unwrap();

    let first = generate_refresh_token();
    let credential = store::create_refresh_credential(&pool, user.id, &first.hash, first.expires_at)
        .await
        .unwrap();
    assert!(credential.is_active(chrono::Utc::now()));

    let second = generate_refresh_token();
    store::rotate_refresh_credential(&pool, credential.id, user.id, &second.hash, second.expires_at)
        .await
        .unwrap();

    let old = store::get_refresh_credential_by_hash(&pool, &hash_refresh_token(&first.raw))
        .await
        .unwrap()
        .expect("old credential row still exists");
    assert!(!old.is_active(chrono::Utc::now()), "rotated-away credential must be revoked");

    let new_credential = store::get_refresh_credential_by_hash(&pool, &hash_refresh_token(&second.raw))
        .await
        .unwrap()
        .expect("new credential row exists");
    assert!(new_credential.is_active(chrono::Utc::now()));
}

#[tokio::test]
async fn logout_everywhere_revokes_all_credentials() {
    let Some(pool) = test_pool().await else {
        return;
    };

    let user = store::create_user(
        &pool,
        &format!("everywhere_{}", Uuid::new_v4().simple()),
        &format!("everywhere_{}@example.com", Uuid::new_v4().simple()),
        "hash",
    )
    .await
    .unwrap();

    let a = generate_refresh_token();
    let b = generate_refresh_token();
    store::create_refresh_credential(&pool, user.id, &a.hash, a.expires_at).await.unwrap();
    store::create_refresh_credential(&pool, user.id, &b.hash, b.expires_at).await.unwrap();

    store::revoke_all_refresh_credentials(&pool, user.id).await.unwrap();

    let a_row = store::get_refresh_credential_by_hash(&pool, &a.hash).await.unwrap().unwrap();
    let b_row = store::get_refresh_credential_by_hash(&pool, &b.hash).await.unwrap().unwrap();
    assert!(!a_row.is_active(chrono::Utc::now()));
    assert!(!b_row.is_active(chrono::Utc::now()));
}
