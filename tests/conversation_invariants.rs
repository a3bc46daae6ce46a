//! Integration tests against a real Postgres instance. Gated behind
//! `TEST_DATABASE_URL` so the suite degrades to a no-op skip rather than a
//! hard failure when no test database is configured, matching the crate's
//! `#[cfg(test)]` convention for DB-backed tests.

use chatcore_server::models::ConversationKind;
use chatcore_server::store;
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

async fn test_pool() -> Option<sqlx::PgPool> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    PgPoolOptions::new().max_connections(4).connect(&url).await.ok()
}

#[tokio::test]
async fn at_most_one_unarchived_direct_conversation_per_pair() {
    let Some(pool) = test_pool().await else {
        return;
    };

    let alice = store::create_user(&pool, &format!("alice_{}", Uuid::new_v4().simple()), &format!("alice_{}@example.com", Uuid::new_v4().simple()), "hash")
        .await
        .unwrap();
    let bob = store::create_user(&pool, &format!("bob_{}", Uuid::new_v4().simple()), &format!("bob_{}@example.com", Uuid::new_v4().simple()), "hash")
        .await
        .unwrap();

    assert!(store::find_direct_between(&pool, alice.id, bob.id).await.unwrap().is_none());

    let conversation = store::create_conversation(
        &pool,
        ConversationKind::Direct,
        None,
        alice.id,
        &[alice.id, bob.id],
    )
    .await
    .unwrap();

    let found = store::find_direct_between(&pool, alice.id, bob.id)
        .await
        .unwrap()
        .expect("direct conversation should be found for either ordering");
    assert_eq!(found.id, conversation.id);

    let found_reversed = store::find_direct_between(&pool, bob.id, alice.id)
        .await
        .unwrap()
        .expect("lookup is order-independent");
    assert_eq!(found_reversed.id, conversation.id);
}

#[tokio::test]
async fn archive_then_unarchive_round_trips_without_changing_unread_count() {
    let Some(pool) = test_pool().await else {
        return;
    };

    let alice = store::create_user(&pool, &format!("alice_{}", Uuid::new_v4().simple()), &format!("alice_{}@example.com", Uuid::new_v4().simple()), "hash")
        .await
        .unwrap();
    let bob = store::create_user(&pool, &format!("bob_{}", Uuid::new_v4().simple()), &format!("bob_{}@example.com", Uuid::new_v4().simple()), "hash")
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

    store::create_message(&pool, conversation.id, alice.id, Some("hello"), None, "c1")
        .await
        .unwrap();

    let before = store::get_unread_count(&pool, conversation.id, bob.id).await.unwrap();
    assert_eq!(before, 1);

    // Archiving removes it from the unarchived listing but must not appear
    // in `find_direct_between` while archived.
    store::archive_conversation(&pool, conversation.id).await.unwrap();
    let fetched = store::get_conversation(&pool, conversation.id).await.unwrap();
    assert!(fetched.is_archived());
    assert!(store::find_direct_between(&pool, alice.id, bob.id).await.unwrap().is_none());

    store::unarchive_conversation(&pool, conversation.id).await.unwrap();
    let fetched = store::get_conversation(&pool, conversation.id).await.unwrap();
    assert!(!fetched.is_archived());

    let after = store::get_unread_count(&pool, conversation.id, bob.id).await.unwrap();
    assert_eq!(before, after, "archiving/unarchiving must not disturb unread state");
}

#[tokio::test]
async fn removing_the_last_admin_is_rejected_by_the_member_count_check() {
    let Some(pool) = test_pool().await else {
        return;
    };

    let alice = store::create_user(&pool, &format!("alice_{}", Uuid::new_v4().simple()), &format!("alice_{}@example.com", Uuid::new_v4().simple()), "hash")
        .await
        .unwrap();
    let bob = store::create_user(&pool, &format!("bob_{}", Uuid::new_v4().simple()), &format!("bob_{}@example.com", Uuid::new_v4().simple()), "hash")
        .await
        .unwrap();

    let conversation = store::create_conversation(
        &pool,
        ConversationKind::Group,
        Some("team chat"),
        alice.id,
        &[alice.id, bob.id],
    )
    .await
    .unwrap();

    assert_eq!(store::count_admins(&pool, conversation.id).await.unwrap(), 1);
    // The REST layer is what actually refuses the removal (it calls
    // count_admins before remove_member); here we just pin the invariant
    // the store exposes for that check to work against.
}
