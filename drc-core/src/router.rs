// ABOUTME: Bus router: decodes inbound envelopes and dispatches them by tag.
// ABOUTME: Pending correlations win over permanent handlers; failures never stall the loop.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::broker::Subscription;
use crate::correlation::{CorrelationRegistry, Discriminator};
use crate::envelope::{decode, Envelope};
use crate::metrics;

/// A permanent handler for one tag. Handlers validate their own `data` and
/// return errors rather than panicking; the router logs and moves on.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> Result<()>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, envelope: Envelope) -> Result<()> {
        (self)(envelope).await
    }
}

/// What the router did with one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Matched a pending correlation; carries the number of callbacks fired.
    Correlated(usize),
    Handled,
    /// A handler ran but returned an error or panicked.
    Failed,
    /// Known but deliberately unhandled tag.
    Ignored,
    Unhandled,
    DecodeError,
}

impl Routed {
    fn outcome(&self) -> &'static str {
        match self {
            Self::Correlated(_) => "correlated",
            Self::Handled => "handled",
            Self::Failed => "failed",
            Self::Ignored => "ignored",
            Self::Unhandled => "unhandled",
            Self::DecodeError => "decode_error",
        }
    }
}

/// Routes envelopes to correlations and handlers.
///
/// Built once at daemon start-up, then shared behind an `Arc` by every
/// subscription loop.
pub struct BusRouter {
    correlations: CorrelationRegistry,
    handlers: HashMap<String, Arc<dyn Handler>>,
    discriminators: HashMap<String, Discriminator>,
    ignored: HashSet<String>,
}

impl BusRouter {
    pub fn new(correlations: CorrelationRegistry) -> Self {
        Self {
            correlations,
            handlers: HashMap::new(),
            discriminators: HashMap::new(),
            ignored: HashSet::new(),
        }
    }

    /// Register the permanent handler for `tag`, replacing any previous one.
    pub fn on<H>(mut self, tag: &str, handler: H) -> Self
    where
        H: Handler + 'static,
    {
        if self.handlers.insert(tag.to_string(), Arc::new(handler)).is_some() {
            tracing::warn!(tag = %tag, "Replacing existing bus handler");
        }
        self
    }

    /// Declare how to pull a correlation discriminator out of `tag` payloads.
    pub fn correlate(mut self, tag: &str, discriminator: Discriminator) -> Self {
        self.discriminators.insert(tag.to_string(), discriminator);
        self
    }

    /// Tags that are known but intentionally unhandled by this daemon.
    pub fn ignore<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignored.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn correlations(&self) -> &CorrelationRegistry {
        &self.correlations
    }

    pub fn handles(&self, tag: &str) -> bool {
        self.handlers.contains_key(tag)
    }

    /// Decode and route one wire message.
    pub async fn route_raw(&self, wire: &str) -> Routed {
        match decode(wire) {
            Ok(envelope) => self.route(envelope).await,
            Err(e) => {
                tracing::warn!(error = %e, payload_len = wire.len(), "Dropping undecodable bus message");
                metrics::record_bus_message(Routed::DecodeError.outcome());
                Routed::DecodeError
            }
        }
    }

    /// Route one decoded envelope.
    pub async fn route(&self, envelope: Envelope) -> Routed {
        let routed = self.dispatch(envelope).await;
        metrics::record_bus_message(routed.outcome());
        routed
    }

    async fn dispatch(&self, envelope: Envelope) -> Routed {
        let tag = envelope.tag.as_str();

        if let Some(fired) = self.try_correlate(&envelope) {
            return Routed::Correlated(fired);
        }

        if let Some(handler) = self.handlers.get(tag) {
            let tag = tag.to_string();
            let outcome = AssertUnwindSafe(handler.handle(envelope)).catch_unwind().await;
            return match outcome {
                Ok(Ok(())) => Routed::Handled,
                Ok(Err(e)) => {
                    tracing::error!(tag = %tag, error = format!("{e:#}"), "Bus handler failed");
                    metrics::record_handler_error();
                    Routed::Failed
                }
                Err(panic) => {
                    let reason = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!(tag = %tag, panic = %reason, "Bus handler panicked");
                    metrics::record_handler_error();
                    Routed::Failed
                }
            };
        }

        if self.ignored.contains(tag) {
            tracing::trace!(tag = %tag, "Ignoring known bus message");
            return Routed::Ignored;
        }

        tracing::warn!(tag = %tag, kind = ?envelope.kind(), "Unhandled bus message");
        Routed::Unhandled
    }

    fn try_correlate(&self, envelope: &Envelope) -> Option<usize> {
        let tag = envelope.tag.as_str();
        let extract = self.discriminators.get(tag)?;
        if !self.correlations.has_tag(tag) {
            return None;
        }
        let discriminator = extract(&envelope.data)?;

        match self.correlations.resolve(tag, &discriminator, envelope.data.clone()) {
            0 => None,
            fired => Some(fired),
        }
    }

    /// Process every delivery on `subscription` in arrival order until the
    /// subscription ends or `shutdown` fires.
    pub async fn serve(self: Arc<Self>, mut subscription: Subscription, shutdown: CancellationToken) {
        let topic = subscription.topic().to_string();
        tracing::info!(topic = %topic, "Bus router serving");
        loop {
            let delivery = tokio::select! {
                delivery = subscription.recv() => delivery,
                _ = shutdown.cancelled() => break,
            };
            let Some(delivery) = delivery else {
                tracing::warn!(topic = %topic, "Bus subscription ended");
                break;
            };
            self.route_raw(&delivery.payload).await;
        }
        tracing::info!(topic = %topic, "Bus router stopped");
    }
}

impl std::fmt::Debug for BusRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<&String> = self.handlers.keys().collect();
        tags.sort();
        f.debug_struct("BusRouter")
            .field("handlers", &tags)
            .field("correlated_tags", &self.discriminators.len())
            .field("ignored", &self.ignored.len())
            .finish()
    }
}
