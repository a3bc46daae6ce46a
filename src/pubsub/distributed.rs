//! Postgres-backed `PubSub` for cross-instance fan-out.
//!
//! Structured like the teacher's outbound delivery retry queue: a durable
//! table is the source of truth, and a background worker polls it on a
//! fixed interval rather than relying on a push notification the process
//! might miss across a restart. Each subscribed topic tracks its own
//! high-water mark (`last_seen_id`) so a slow or restarted poller resumes
//! exactly where it left off instead of replaying the whole log.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{Envelope, Handler, PubSub, Subscription};

const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(500);
const POLL_BATCH_SIZE: i64 = 200;

struct TopicState {
    last_seen_id: i64,
    handlers: Vec<(u64, Handler)>,
}

pub struct DistributedPubSub {
    pool: PgPool,
    instance_id: String,
    topics: Arc<RwLock<HashMap<String, TopicState>>>,
    next_handler_id: AtomicU64,
}

impl DistributedPubSub {
    pub fn new(pool: PgPool, instance_id: impl Into<String>) -> Self {
        Self {
            pool,
            instance_id: instance_id.into(),
            topics: Arc::new(RwLock::new(HashMap::new())),
            next_handler_id: AtomicU64::new(0),
        }
    }

    /// Run the background poller. Call once from server startup; returns
    /// when `shutdown` is cancelled.
    pub async fn run_worker(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("distributed pubsub poller started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!(error = %e, "distributed pubsub poll failed");
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("distributed pubsub poller shutting down");
                    break;
                }
            }
        }
    }

    async fn poll_once(&self) -> anyhow::Result<()> {
        let topic_names: Vec<String> = self.topics.read().await.keys().cloned().collect();

        for topic in topic_names {
            let since = {
                let topics = self.topics.read().await;
                match topics.get(&topic) {
                    Some(state) => state.last_seen_id,
                    None => continue,
                }
            };

            let rows: Vec<(i64, String, serde_json::Value)> = sqlx::query_as(
                r#"
                SELECT id, instance_id, payload
                FROM pubsub_events
                WHERE topic = $1 AND id > $2
                ORDER BY id ASC
                LIMIT $3
                "#,
            )
            .bind(&topic)
            .bind(since)
            .bind(POLL_BATCH_SIZE)
            .fetch_all(&self.pool)
            .await?;

            if rows.is_empty() {
                continue;
            }

            let mut topics = self.topics.write().await;
            let Some(state) = topics.get_mut(&topic) else {
                continue;
            };

            for (id, origin_instance, payload) in rows {
                state.last_seen_id = id;
                // Bypass-for-local-recipients (spec §9 option b): this
                // backend only fires handlers for envelopes that did not
                // originate on this instance, since same-instance delivery
                // already happened synchronously through the in-memory path.
                if origin_instance == self.instance_id {
                    continue;
                }
                for (_, handler) in &state.handlers {
                    handler(Envelope {
                        topic: topic.clone(),
                        instance_id: origin_instance.clone(),
                        payload: payload.clone(),
                    });
                }
            }
            debug!(topic = %topic, "delivered distributed pubsub batch");
        }

        Ok(())
    }
}

#[async_trait]
impl PubSub for DistributedPubSub {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> anyhow::Result<()> {
        sqlx::query("INSERT INTO pubsub_events (topic, instance_id, payload) VALUES ($1, $2, $3)")
            .bind(topic)
            .bind(&self.instance_id)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: Handler) -> anyhow::Result<Subscription> {
        let max_id: Option<i64> =
            sqlx::query_scalar("SELECT MAX(id) FROM pubsub_events WHERE topic = $1")
                .bind(topic)
                .fetch_one(&self.pool)
                .await?;

        let handler_id = self.next_handler_id.fetch_add(1, Ordering::Relaxed);
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicState {
                last_seen_id: max_id.unwrap_or(0),
                handlers: Vec::new(),
            })
            .handlers
            .push((handler_id, handler));
        drop(topics);

        // Without this, a left-then-rejoined room would accumulate a second
        // handler entry for the same topic and double-deliver every event
        // polled off the durable log.
        let topics = self.topics.clone();
        let topic_owned = topic.to_string();
        Ok(Subscription::new(move || {
            tokio::spawn(async move {
                if let Some(state) = topics.write().await.get_mut(&topic_owned) {
                    state.handlers.retain(|(id, _)| *id != handler_id);
                }
            });
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> Option<PgPool> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .ok()
    }

    #[tokio::test]
    async fn publish_then_poll_delivers_to_remote_instance_only() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let publisher = DistributedPubSub::new(pool.clone(), "instance-a");
        let subscriber = DistributedPubSub::new(pool, "instance-b");

        let delivered = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let delivered_clone = delivered.clone();
        subscriber
            .subscribe(
                "room:test-distributed",
                Arc::new(move |_env| {
                    delivered_clone.store(true, std::sync::atomic::Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        publisher
            .publish("room:test-distributed", serde_json::json!({"hi": true}))
            .await
            .unwrap();

        subscriber.poll_once().await.unwrap();
        assert!(delivered.load(std::sync::atomic::Ordering::SeqCst));
    }
}
