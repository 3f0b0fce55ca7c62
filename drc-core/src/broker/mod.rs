// ABOUTME: Publish/subscribe broker abstraction shared by every daemon.
// ABOUTME: Topics are plain strings; payloads are opaque UTF-8 text (encoded envelopes).

pub mod memory;
pub mod tcp;

pub use memory::MemoryBroker;
pub use tcp::{serve_broker, TcpBroker};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// A message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub payload: String,
}

type Unsubscribe = Box<dyn FnOnce() + Send + 'static>;

/// A live subscription to one topic. Dropping it unsubscribes.
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<Delivery>,
    unsubscribe: Option<Unsubscribe>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, rx: mpsc::UnboundedReceiver<Delivery>) -> Self {
        Self {
            topic: topic.into(),
            rx,
            unsubscribe: None,
        }
    }

    /// Run `hook` exactly once when this subscription is dropped.
    pub fn on_drop(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.unsubscribe = Some(Box::new(hook));
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next delivery in arrival order, or None once the broker side is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.rx.close();
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish()
    }
}

/// The shared broker. Delivery is best-effort: no durability, no
/// acknowledgment, and no ordering across publishers or topics. Messages
/// from one publisher on one topic arrive in publish order.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, payload: String) -> Result<()>;

    /// Subscribe to `topic`. Messages the broker handles after registering the
    /// subscription are delivered; earlier ones are not replayed.
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
}
