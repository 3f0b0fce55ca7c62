// ABOUTME: One-shot correlation table matching broadcast replies to the waiter that asked.
// ABOUTME: Entries keyed by (event tag, discriminator) are removed as soon as they fire.

use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

use crate::metrics;

/// Callback run with the reply payload.
pub type Callback = Box<dyn FnOnce(Value) + Send + 'static>;

/// Identifies a single registered callback so its owner can withdraw it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ticket {
    tag: String,
    discriminator: String,
    id: u64,
}

impl Ticket {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn discriminator(&self) -> &str {
        &self.discriminator
    }
}

#[derive(Default)]
struct Table {
    // tag -> discriminator -> callbacks in registration order
    buckets: HashMap<String, HashMap<String, Vec<(u64, Callback)>>>,
    next_id: u64,
    pending: usize,
}

/// Shared, cloneable correlation table.
///
/// There is no built-in timeout: a caller that must not wait forever arms its
/// own timer and [`cancel`](Self::cancel)s its ticket on expiry.
#[derive(Clone, Default)]
pub struct CorrelationRegistry {
    table: Arc<Mutex<Table>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        // Callbacks never run under the lock, so a poisoned table is still consistent.
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a callback for `(tag, discriminator)`.
    pub fn register<F>(&self, tag: &str, discriminator: &str, callback: F) -> Ticket
    where
        F: FnOnce(Value) + Send + 'static,
    {
        let mut table = self.table();
        let id = table.next_id;
        table.next_id += 1;
        table
            .buckets
            .entry(tag.to_string())
            .or_default()
            .entry(discriminator.to_string())
            .or_default()
            .push((id, Box::new(callback)));
        table.pending += 1;
        metrics::set_pending_correlations(table.pending);

        tracing::trace!(tag = %tag, discriminator = %discriminator, id, "Correlation registered");
        Ticket {
            tag: tag.to_string(),
            discriminator: discriminator.to_string(),
            id,
        }
    }

    /// Register and hand back a receiver that yields the reply payload.
    pub fn wait(&self, tag: &str, discriminator: &str) -> (Ticket, oneshot::Receiver<Value>) {
        let (tx, rx) = oneshot::channel();
        let ticket = self.register(tag, discriminator, move |payload| {
            let _ = tx.send(payload);
        });
        (ticket, rx)
    }

    /// Run and remove every callback registered for exactly `(tag, discriminator)`.
    /// A panicking callback is logged and does not stop the ones after it.
    ///
    /// Returns how many callbacks fired; zero means nothing was waiting.
    pub fn resolve(&self, tag: &str, discriminator: &str, payload: Value) -> usize {
        let callbacks = {
            let mut table = self.table();
            let Some(by_discriminator) = table.buckets.get_mut(tag) else {
                return 0;
            };
            let Some(callbacks) = by_discriminator.remove(discriminator) else {
                return 0;
            };
            if by_discriminator.is_empty() {
                table.buckets.remove(tag);
            }
            table.pending -= callbacks.len();
            metrics::set_pending_correlations(table.pending);
            callbacks
        };

        let fired = callbacks.len();
        tracing::debug!(tag = %tag, discriminator = %discriminator, fired, "Correlation resolved");
        for (id, callback) in callbacks {
            let data = payload.clone();
            if catch_unwind(AssertUnwindSafe(move || callback(data))).is_err() {
                tracing::error!(tag = %tag, discriminator = %discriminator, id, "Correlation callback panicked");
                metrics::record_handler_error();
            }
        }
        fired
    }

    /// Withdraw a single callback. Returns false if it already fired or was cancelled.
    pub fn cancel(&self, ticket: &Ticket) -> bool {
        let mut table = self.table();
        let Some(by_discriminator) = table.buckets.get_mut(&ticket.tag) else {
            return false;
        };
        let Some(callbacks) = by_discriminator.get_mut(&ticket.discriminator) else {
            return false;
        };
        let before = callbacks.len();
        callbacks.retain(|(id, _)| *id != ticket.id);
        let removed = before != callbacks.len();

        if callbacks.is_empty() {
            by_discriminator.remove(&ticket.discriminator);
        }
        if by_discriminator.is_empty() {
            table.buckets.remove(&ticket.tag);
        }
        if removed {
            table.pending -= 1;
            metrics::set_pending_correlations(table.pending);
        }
        removed
    }

    pub fn is_pending(&self, tag: &str, discriminator: &str) -> bool {
        self.table()
            .buckets
            .get(tag)
            .is_some_and(|by_discriminator| by_discriminator.contains_key(discriminator))
    }

    /// Whether anything at all waits on `tag`.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.table().buckets.contains_key(tag)
    }

    /// Total number of pending callbacks.
    pub fn pending(&self) -> usize {
        self.table().pending
    }
}

impl std::fmt::Debug for CorrelationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorrelationRegistry")
            .field("pending", &self.pending())
            .finish()
    }
}

/// Pulls a discriminator out of a reply payload.
pub type Discriminator = Arc<dyn Fn(&Value) -> Option<String> + Send + Sync>;

/// Discriminator taken from a single string or number field.
pub fn by_field(field: &str) -> Discriminator {
    let field = field.to_string();
    Arc::new(move |data| field_string(data, &field))
}

/// Discriminator built by joining several fields with `:`. Missing fields yield `None`.
pub fn compound(fields: &[&str]) -> Discriminator {
    let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
    Arc::new(move |data| {
        let parts = fields
            .iter()
            .map(|f| field_string(data, f))
            .collect::<Option<Vec<_>>>()?;
        Some(parts.join(":"))
    })
}

fn field_string(data: &Value, field: &str) -> Option<String> {
    match data.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
