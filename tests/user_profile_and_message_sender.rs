//! Integration tests for the user-profile fields and the eager sender join
//! on `GetMessages` (spec §3 User data model; spec §4.1 `GetMessages`).
//! Gated behind `TEST_DATABASE_URL`, same convention as the rest of the
//! suite.

use chatcore_server::models::ConversationKind;
use chatcore_server::store;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

async fn test_pool() -> Option<sqlx::PgPool> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    PgPoolOptions::new().max_connections(4).connect(&url).await.ok()
}

#[tokio::test]
async fn update_user_profile_changes_only_the_given_fields() {
    let Some(pool) = test_pool().await else {
        return;
    };

    let user = store::create_user(
        &pool,
        &format!("profile_{}", Uuid::new_v4().simple()),
        &format!("profile_{}@example.com", Uuid::new_v4().simple()),
        "hash",
    )
    .await
    .unwrap();
    assert!(user.display_name.is_none());
    assert!(user.show_online_status);
    assert!(user.read_receipts_enabled);

    let updated = store::update_user_profile(&pool, user.id, Some("Ada"), None, Some(false), None)
        .await
        .unwrap();
    assert_eq!(updated.display_name.as_deref(), Some("Ada"));
    assert!(!updated.show_online_status, "explicitly set field must change");
    assert!(updated.read_receipts_enabled, "field left as None must be unchanged");
    assert!(updated.updated_at >= user.updated_at);

    let again = store::update_user_profile(&pool, user.id, None, Some("https://example.com/a.png"), None, None)
        .await
        .unwrap();
    assert_eq!(again.display_name.as_deref(), Some("Ada"), "omitted field stays as previously set");
    assert_eq!(again.avatar_url.as_deref(), Some("https://example.com/a.png"));
}

#[tokio::test]
async fn search_users_matches_username_prefix_case_insensitively() {
    let Some(pool) = test_pool().await else {
        return;
    };

    let suffix = Uuid::new_v4().simple().to_string();
    let username = format!("Zelda_{suffix}");
    store::create_user(&pool, &username, &format!("zelda_{suffix}@example.com"), "hash")
        .await
        .unwrap();

    let results = store::search_users(&pool, &format!("zelda_{suffix}"), None).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].username, username);
}

#[tokio::test]
async fn get_messages_eagerly_loads_sender_profile() {
    let Some(pool) = test_pool().await else {
        return;
    };

    let alice = store::create_user(
        &pool,
        &format!("alice_{}", Uuid::new_v4().simple()),
        &format!("alice_{}@example.com", Uuid::new_v4().simple()),
        "hash",
    )
    .await
    .unwrap();
    let bob = store::create_user(
        &pool,
        &format!("bob_{}", Uuid::new_v4().simple()),
        &format!("bob_{}@example.com", Uuid::new_v4().simple()),
        "hash",
    )
    .await
    .unwrap();
    store::update_user_profile(&pool, alice.id, Some("Alice A."), None, None, None)
        .await
        .unwrap();

    let conversation = store::create_conversation(
        &pool,
        ConversationKind::Direct,
        None,
        alice.id,
        &[alice.id, bob.id],
    )
    .await
    .unwrap();

    store::create_message(&pool, conversation.id, alice.id, Some("hi bob"), None, "c1")
        .await
        .unwrap();

    let messages = store::get_messages(&pool, conversation.id, None, None).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].sender_username.as_deref(), Some(alice.username.as_str()));
    assert_eq!(messages[0].sender_display_name.as_deref(), Some("Alice A."));
}
