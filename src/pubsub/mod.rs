//! Two-tier fan-out abstraction: an in-process backend for single-instance
//! delivery plus a durable, distributed backend for cross-instance delivery.
//!
//! Both backends implement [`PubSub`]. The Hub (`crate::hub`) is the only
//! caller; it does not care which backend is wired in.

pub mod distributed;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A published event, framed the same way regardless of backend. `instance_id`
/// identifies the process that published it, used by distributed backends to
/// suppress delivering an envelope back to its own originator (spec §4.2/§4.5
/// self-delivery note).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub instance_id: String,
    pub payload: serde_json::Value,
}

/// Canonical topic names. Keeping these in one place avoids typo'd topic
/// strings drifting between the Hub and the Broadcaster.
pub struct Topics;

impl Topics {
    pub fn room(conversation_id: uuid::Uuid) -> String {
        format!("room:{conversation_id}")
    }

    pub fn user(user_id: uuid::Uuid) -> String {
        format!("user:{user_id}")
    }
}

/// A live subscription. Dropping it does not unsubscribe — call
/// [`Subscription::unsubscribe`] explicitly, matching the Hub's room-leave
/// bookkeeping (it decides when a topic's last local subscriber left).
#[must_use]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

pub type Handler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// At-least-once, FIFO-per-topic delivery. No ordering guarantee across
/// topics.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Returns once the envelope is durably accepted by the backend: for the
    /// in-memory backend that means enqueued on every current subscriber's
    /// channel; for the distributed backend, once the broker has ack'd it.
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> anyhow::Result<()>;

    /// Registers `handler`, invoked once per envelope in publish order from a
    /// backend-owned task. Handlers must not block indefinitely.
    async fn subscribe(&self, topic: &str, handler: Handler) -> anyhow::Result<Subscription>;
}
