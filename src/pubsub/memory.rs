//! Process-local `PubSub` backend: one `tokio::sync::broadcast` channel per
//! topic, created lazily and torn down once both the channel's senders and
//! the Hub's interest in it have gone away.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tracing::warn;

use super::{Envelope, Handler, PubSub, Subscription};

const CHANNEL_CAPACITY: usize = 1024;

pub struct MemoryPubSub {
    instance_id: String,
    channels: Arc<RwLock<HashMap<String, broadcast::Sender<Envelope>>>>,
}

impl MemoryPubSub {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            channels: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    async fn channel_for(&self, topic: &str) -> broadcast::Sender<Envelope> {
        let mut channels = self.channels.write().await;
        channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> anyhow::Result<()> {
        let tx = self.channel_for(topic).await;
        // No receivers is not an error: a room with no local subscribers on
        // this instance is a normal state, not a delivery failure.
        let _ = tx.send(Envelope {
            topic: topic.to_string(),
            instance_id: self.instance_id.clone(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: Handler) -> anyhow::Result<Subscription> {
        let tx = self.channel_for(topic).await;
        let mut rx = tx.subscribe();
        let (cancel_tx, mut cancel_rx) = tokio::sync::oneshot::channel::<()>();

        let topic_owned = topic.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut cancel_rx => break,
                    received = rx.recv() => match received {
                        Ok(envelope) => handler(envelope),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(topic = %topic_owned, skipped, "subscriber lagged, events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        // Dropping the receiver task on unsubscribe matters: without it, a
        // left-then-rejoined room would accumulate a second live subscriber
        // task alongside the new one and double-deliver every event.
        Ok(Subscription::new(move || {
            let _ = cancel_tx.send(());
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn delivers_published_envelope_to_subscriber() {
        let pubsub = MemoryPubSub::new("instance-a");
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();

        pubsub
            .subscribe(
                "room:test",
                Arc::new(move |_env| {
                    count_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        pubsub
            .publish("room:test", serde_json::json!({"hello": "world"}))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_error() {
        let pubsub = MemoryPubSub::new("instance-a");
        assert!(pubsub
            .publish("room:empty", serde_json::json!({}))
            .await
            .is_ok());
    }
}
