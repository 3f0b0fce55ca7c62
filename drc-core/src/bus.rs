// ABOUTME: Bus facade: publish envelopes on the shared topic and await correlated replies.
// ABOUTME: Request/response is register -> publish -> wait, with a caller-owned timeout.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::broker::{Broker, Subscription};
use crate::correlation::CorrelationRegistry;
use crate::envelope::{Envelope, Tag};

/// Handle onto one logical bus (one shared topic on one broker).
#[derive(Clone)]
pub struct Bus {
    broker: Arc<dyn Broker>,
    topic: String,
    correlations: CorrelationRegistry,
}

impl Bus {
    pub fn new(
        broker: Arc<dyn Broker>,
        topic: impl Into<String>,
        correlations: CorrelationRegistry,
    ) -> Self {
        Self {
            broker,
            topic: topic.into(),
            correlations,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn correlations(&self) -> &CorrelationRegistry {
        &self.correlations
    }

    /// Subscribe to the shared topic.
    pub async fn subscribe(&self) -> Result<Subscription> {
        self.broker.subscribe(&self.topic).await
    }

    /// Publish `{type: tag, data}` on the shared topic.
    pub async fn publish<T: Serialize>(&self, tag: &str, data: &T) -> Result<()> {
        let tag = Tag::parse(tag)?;
        let data = serde_json::to_value(data).context("Failed to serialize envelope data")?;
        self.publish_envelope(&Envelope::new(tag, data)).await
    }

    pub async fn publish_envelope(&self, envelope: &Envelope) -> Result<()> {
        tracing::trace!(topic = %self.topic, tag = %envelope.tag, "Publishing envelope");
        self.broker.publish(&self.topic, envelope.encode()).await
    }

    /// Publish a request and wait up to `timeout` for the reply tagged
    /// `reply_tag` carrying `discriminator`.
    ///
    /// Returns `Ok(None)` when no reply arrives in time; the pending
    /// correlation is withdrawn so nothing dangles. Replies are only matched
    /// if the router serving this bus knows how to extract a discriminator
    /// from `reply_tag` payloads.
    pub async fn request<T: Serialize>(
        &self,
        tag: &str,
        data: &T,
        reply_tag: &str,
        discriminator: &str,
        timeout: Duration,
    ) -> Result<Option<Value>> {
        let (ticket, reply) = self.correlations.wait(reply_tag, discriminator);

        if let Err(e) = self.publish(tag, data).await {
            self.correlations.cancel(&ticket);
            return Err(e);
        }

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(payload)) => Ok(Some(payload)),
            Ok(Err(_)) => Ok(None),
            Err(_) => {
                self.correlations.cancel(&ticket);
                tracing::debug!(
                    tag = %tag,
                    reply_tag = %reply_tag,
                    discriminator = %discriminator,
                    timeout_ms = timeout.as_millis() as u64,
                    "No reply before timeout"
                );
                Ok(None)
            }
        }
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("topic", &self.topic)
            .field("correlations", &self.correlations)
            .finish()
    }
}
