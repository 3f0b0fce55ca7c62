// ABOUTME: Networked broker: newline-delimited JSON frames over TCP, client and server sides.
// ABOUTME: The server fans out through a MemoryBroker; each connection keeps its own subscriptions.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

use super::{Broker, Delivery, MemoryBroker, Subscription};

/// Longest accepted frame line (16 MiB).
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// One line on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Frame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Publish { topic: String, payload: String },
    /// Server -> client delivery on a subscribed topic.
    Message { topic: String, payload: String },
}

impl Frame {
    fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Default)]
struct LocalSubscribers {
    topics: HashMap<String, Vec<(u64, mpsc::UnboundedSender<Delivery>)>>,
    next_id: u64,
}

/// Client connection to a broker served by [`serve_broker`].
pub struct TcpBroker {
    outbound: mpsc::UnboundedSender<Frame>,
    subscribers: Arc<Mutex<LocalSubscribers>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

fn lock(subscribers: &Mutex<LocalSubscribers>) -> MutexGuard<'_, LocalSubscribers> {
    subscribers.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TcpBroker {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .context("Failed to connect to broker")?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN));
        let (mut sink, mut lines) = framed.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if let Err(e) = sink.send(frame.to_line()).await {
                    tracing::error!(error = %e, "Broker connection write failed");
                    break;
                }
            }
        });

        let subscribers: Arc<Mutex<LocalSubscribers>> = Arc::default();
        let reader_subs = Arc::clone(&subscribers);
        let reader_outbound = outbound.clone();
        let reader = tokio::spawn(async move {
            while let Some(line) = lines.next().await {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::error!(error = %e, "Broker connection read failed");
                        break;
                    }
                };
                match serde_json::from_str::<Frame>(&line) {
                    Ok(Frame::Message { topic, payload }) => {
                        dispatch_local(&reader_subs, &reader_outbound, topic, payload);
                    }
                    Ok(other) => {
                        tracing::warn!(frame = ?other, "Unexpected frame from broker");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Undecodable frame from broker");
                    }
                }
            }
            tracing::warn!("Broker connection closed");
            // Ends every local subscription.
            lock(&reader_subs).topics.clear();
        });

        tracing::info!(peer = %peer, "Connected to broker");
        Ok(Self {
            outbound,
            subscribers,
            reader,
            writer,
        })
    }

    fn send(&self, frame: Frame) -> Result<()> {
        self.outbound
            .send(frame)
            .map_err(|_| anyhow::anyhow!("Broker connection is closed"))
    }

    /// Topics this connection is subscribed to, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = lock(&self.subscribers).topics.keys().cloned().collect();
        topics.sort();
        topics
    }
}

/// Drop one local subscriber; the last one for a topic unsubscribes at the server.
fn unsubscribe_local(
    subscribers: &Mutex<LocalSubscribers>,
    outbound: &mpsc::UnboundedSender<Frame>,
    topic: &str,
    id: u64,
) {
    let mut subs = lock(subscribers);
    let Some(senders) = subs.topics.get_mut(topic) else {
        return;
    };
    senders.retain(|(sender_id, _)| *sender_id != id);
    if senders.is_empty() {
        subs.topics.remove(topic);
        // Sent under the lock so a racing resubscribe queues after it.
        let _ = outbound.send(Frame::Unsubscribe {
            topic: topic.to_string(),
        });
    }
}

fn dispatch_local(
    subscribers: &Mutex<LocalSubscribers>,
    outbound: &mpsc::UnboundedSender<Frame>,
    topic: String,
    payload: String,
) {
    let mut subs = lock(subscribers);
    let Some(senders) = subs.topics.get_mut(&topic) else {
        return;
    };
    let delivery = Delivery {
        topic: topic.clone(),
        payload,
    };
    senders.retain(|(_, tx)| tx.send(delivery.clone()).is_ok());
    if senders.is_empty() {
        subs.topics.remove(&topic);
        let _ = outbound.send(Frame::Unsubscribe { topic });
    }
}

#[async_trait]
impl Broker for TcpBroker {
    async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        self.send(Frame::Publish {
            topic: topic.to_string(),
            payload,
        })
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut subs = lock(&self.subscribers);
            let id = subs.next_id;
            subs.next_id += 1;
            let senders = subs.topics.entry(topic.to_string()).or_default();
            if senders.is_empty() {
                if let Err(e) = self.send(Frame::Subscribe {
                    topic: topic.to_string(),
                }) {
                    subs.topics.remove(topic);
                    return Err(e);
                }
            }
            senders.push((id, tx));
            id
        };

        let subscribers = Arc::downgrade(&self.subscribers);
        let outbound = self.outbound.clone();
        let owned = topic.to_string();
        Ok(Subscription::new(topic, rx).on_drop(move || {
            if let Some(subscribers) = subscribers.upgrade() {
                unsubscribe_local(&subscribers, &outbound, &owned, id);
            }
        }))
    }
}

impl Drop for TcpBroker {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Accept broker clients on `listener` until `shutdown` fires.
pub async fn serve_broker(listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
    let hub = MemoryBroker::new();
    let local = listener.local_addr().context("Listener has no local address")?;
    tracing::info!(addr = %local, "Broker listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("Failed to accept broker client")?;
                tracing::debug!(peer = %peer, "Broker client connected");
                let hub = hub.clone();
                let shutdown = shutdown.child_token();
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, hub, shutdown).await {
                        tracing::warn!(peer = %peer, error = %e, "Broker client failed");
                    }
                    tracing::debug!(peer = %peer, "Broker client disconnected");
                });
            }
            _ = shutdown.cancelled() => {
                tracing::info!("Broker shutting down");
                return Ok(());
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    hub: MemoryBroker,
    shutdown: CancellationToken,
) -> Result<()> {
    let framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN));
    let (mut sink, mut lines) = framed.split();

    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sink.send(frame.to_line()).await.is_err() {
                break;
            }
        }
    });

    let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();
    let result = loop {
        let line = tokio::select! {
            line = lines.next() => line,
            _ = shutdown.cancelled() => break Ok(()),
        };
        let line = match line {
            Some(Ok(line)) => line,
            Some(Err(e)) => break Err(anyhow::Error::new(e).context("Broker client read failed")),
            None => break Ok(()),
        };

        match serde_json::from_str::<Frame>(&line) {
            Ok(Frame::Publish { topic, payload }) => {
                hub.deliver(&topic, payload);
            }
            Ok(Frame::Subscribe { topic }) => {
                if forwarders.contains_key(&topic) {
                    continue;
                }
                let mut sub = hub.subscribe_now(&topic);
                let outbound = outbound.clone();
                let handle = tokio::spawn(async move {
                    while let Some(Delivery { topic, payload }) = sub.recv().await {
                        if outbound.send(Frame::Message { topic, payload }).is_err() {
                            break;
                        }
                    }
                });
                forwarders.insert(topic, handle);
            }
            Ok(Frame::Unsubscribe { topic }) => {
                if let Some(handle) = forwarders.remove(&topic) {
                    handle.abort();
                }
            }
            Ok(Frame::Message { .. }) => {
                tracing::warn!("Client sent a server-only message frame; ignoring");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Dropping undecodable frame");
            }
        }
    };

    for (_, handle) in forwarders {
        handle.abort();
    }
    writer.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn start_server() -> (std::net::SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve_broker(listener, shutdown.clone()));
        (addr, shutdown)
    }

    #[test]
    fn test_frame_wire_format() {
        let frame = Frame::Publish {
            topic: "drc".to_string(),
            payload: "{}".to_string(),
        };
        assert_eq!(frame.to_line(), r#"{"op":"publish","topic":"drc","payload":"{}"}"#);
    }

    #[tokio::test]
    async fn test_tcp_publish_subscribe_between_connections() {
        let (addr, shutdown) = start_server().await;
        let subscriber = TcpBroker::connect(addr).await.unwrap();
        let publisher = TcpBroker::connect(addr).await.unwrap();

        let mut sub = subscriber.subscribe("drc").await.unwrap();
        // Subscribe frame travels on another connection; give the server a moment.
        tokio::time::sleep(Duration::from_millis(100)).await;

        for i in 0..5 {
            publisher.publish("drc", format!("m{i}")).await.unwrap();
        }
        for i in 0..5 {
            let delivery = tokio::time::timeout(Duration::from_secs(5), sub.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(delivery.topic, "drc");
            assert_eq!(delivery.payload, format!("m{i}"));
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_tcp_same_connection_loopback() {
        let (addr, shutdown) = start_server().await;
        let broker = TcpBroker::connect(addr).await.unwrap();
        let mut a = broker.subscribe("t").await.unwrap();
        let mut b = broker.subscribe("t").await.unwrap();
        broker.publish("t", "hello".to_string()).await.unwrap();

        for sub in [&mut a, &mut b] {
            let delivery = tokio::time::timeout(Duration::from_secs(5), sub.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(delivery.payload, "hello");
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_tcp_dropped_subscriptions_unsubscribe() {
        let (addr, shutdown) = start_server().await;
        let broker = TcpBroker::connect(addr).await.unwrap();
        let publisher = TcpBroker::connect(addr).await.unwrap();

        for i in 0..100 {
            let sub = broker.subscribe(&format!("one-off:{i}")).await.unwrap();
            drop(sub);
        }
        assert!(broker.topics().is_empty());

        // Resubscribing after an unsubscribe still receives.
        drop(broker.subscribe("again").await.unwrap());
        let mut sub = broker.subscribe("again").await.unwrap();
        assert_eq!(broker.topics(), vec!["again"]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        publisher.publish("again", "back".to_string()).await.unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.payload, "back");
        shutdown.cancel();
    }
}
