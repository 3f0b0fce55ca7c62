// ABOUTME: In-process broker fanning published payloads out to per-subscriber queues.
// ABOUTME: Backs tests and single-process deployments, and is the fan-out core of the TCP broker.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

use super::{Broker, Delivery, Subscription};

#[derive(Default)]
struct Hub {
    topics: HashMap<String, Vec<(u64, mpsc::UnboundedSender<Delivery>)>>,
    next_id: u64,
}

impl Hub {
    fn remove(&mut self, topic: &str, id: u64) {
        let Some(subscribers) = self.topics.get_mut(topic) else {
            return;
        };
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        if subscribers.is_empty() {
            self.topics.remove(topic);
        }
    }
}

fn lock(hub: &Mutex<Hub>) -> MutexGuard<'_, Hub> {
    hub.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fan `payload` out to every live subscriber of `topic`, pruning dropped
    /// ones. Returns the number of subscribers reached.
    pub fn deliver(&self, topic: &str, payload: String) -> usize {
        let mut hub = lock(&self.hub);
        let Some(subscribers) = hub.topics.get_mut(topic) else {
            return 0;
        };
        let delivery = Delivery {
            topic: topic.to_string(),
            payload,
        };
        subscribers.retain(|(_, tx)| tx.send(delivery.clone()).is_ok());
        let reached = subscribers.len();
        if reached == 0 {
            hub.topics.remove(topic);
        }
        reached
    }

    /// Register a subscriber without going through the async trait.
    pub fn subscribe_now(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut hub = lock(&self.hub);
            let id = hub.next_id;
            hub.next_id += 1;
            hub.topics.entry(topic.to_string()).or_default().push((id, tx));
            id
        };
        let hub = Arc::downgrade(&self.hub);
        let owned = topic.to_string();
        Subscription::new(topic, rx).on_drop(move || {
            if let Some(hub) = hub.upgrade() {
                lock(&hub).remove(&owned, id);
            }
        })
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.hub).topics.get(topic).map_or(0, Vec::len)
    }

    /// Topics with at least one subscriber, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = lock(&self.hub).topics.keys().cloned().collect();
        topics.sort();
        topics
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        let reached = self.deliver(topic, payload);
        tracing::trace!(topic = %topic, reached, "Published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        Ok(self.subscribe_now(topic))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fan_out_in_order() {
        let broker = MemoryBroker::new();
        let mut a = broker.subscribe("drc").await.unwrap();
        let mut b = broker.subscribe("drc").await.unwrap();
        let mut other = broker.subscribe("elsewhere").await.unwrap();

        for i in 0..3 {
            broker.publish("drc", format!("m{i}")).await.unwrap();
        }

        for sub in [&mut a, &mut b] {
            for i in 0..3 {
                assert_eq!(sub.recv().await.unwrap().payload, format!("m{i}"));
            }
        }
        assert!(other.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_pruned() {
        let broker = MemoryBroker::new();
        let sub = broker.subscribe("drc").await.unwrap();
        assert_eq!(broker.subscriber_count("drc"), 1);
        drop(sub);
        assert_eq!(broker.subscriber_count("drc"), 0);
        assert!(broker.topics().is_empty());
        assert_eq!(broker.deliver("drc", "late".to_string()), 0);
    }

    #[tokio::test]
    async fn test_dropping_subscriptions_frees_unpublished_topics() {
        let broker = MemoryBroker::new();
        let keep = broker.subscribe("shared").await.unwrap();
        for i in 0..1000 {
            let a = broker.subscribe(&format!("one-off:{i}")).await.unwrap();
            let b = broker.subscribe("shared").await.unwrap();
            drop(a);
            drop(b);
        }
        assert_eq!(broker.topics(), vec!["shared"]);
        assert_eq!(broker.subscriber_count("shared"), 1);
        drop(keep);
        assert!(broker.topics().is_empty());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let broker = MemoryBroker::new();
        broker.publish("nobody", "x".to_string()).await.unwrap();
        let mut sub = broker.subscribe("nobody").await.unwrap();
        assert!(sub.try_recv().is_none());
    }
}
