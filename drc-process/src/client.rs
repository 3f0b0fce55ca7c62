// ABOUTME: Client-side proxy for a process running inside the host daemon.
// ABOUTME: Mirrors a local child handle (write/end/kill/events/wait) using only bus sub-channels.

use anyhow::{Context, Result};
use futures_util::stream::{self, BoxStream, SelectAll};
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use drc_core::{encode, Broker, EventKind, Subscription};

use crate::channel::{
    control_channel, AckClose, Chunk, InputAction, ProcessChannels, ProcessClosed, ProcessEvent,
    ProcessExit, ProcessFailure, SpawnRequest, Spawned, StreamEvent, StreamName,
};

/// Lifecycle of a [`RemoteProcess`], in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProcessState {
    Created,
    /// Spawn request published, host has not confirmed yet.
    Spawning,
    Running,
    /// Close observed; the terminal handler is running.
    Closing,
    /// Terminal handler done and the acknowledgment published.
    Closed,
}

/// Everything the host reports about the process, in per-channel order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEvent {
    Spawn { pid: Option<u32> },
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    StreamClosed(StreamName),
    Exit(ProcessExit),
    Error(String),
    Disconnect,
    Message(Value),
    Close(ProcessExit),
}

type CloseHandler = Box<dyn FnOnce(&ProcessExit) + Send>;

/// Builder for a process spawned inside the host daemon.
pub struct RemoteCommand {
    binary: String,
    args: Vec<String>,
    on_close: Option<CloseHandler>,
}

impl RemoteCommand {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            on_close: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Runs once when the process closes, before the host is told it may
    /// release the process.
    pub fn on_close<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(&ProcessExit) + Send + 'static,
    {
        self.on_close = Some(Box::new(handler));
        self
    }

    /// Subscribe to every event sub-channel, then ask the host to spawn.
    pub async fn spawn(
        self,
        broker: Arc<dyn Broker>,
        topic: &str,
        marker: &str,
    ) -> Result<RemoteProcess> {
        let drc_pid = uuid::Uuid::new_v4().to_string();
        let channels = ProcessChannels::new(topic, marker, &drc_pid);
        let control = control_channel(topic, marker);
        let (state_tx, state_rx) = watch::channel(ProcessState::Created);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let mut sources = Vec::new();
        for event in ProcessEvent::ALL {
            let sub = broker.subscribe(&channels.process(event)).await?;
            sources.push(tagged(sub, Source::Process(event)));
        }
        for name in StreamName::ALL {
            for event in StreamEvent::ALL {
                let sub = broker.subscribe(&channels.stream(name, event)).await?;
                sources.push(tagged(sub, Source::Stream(name, event)));
            }
        }

        state_tx.send_replace(ProcessState::Spawning);
        let pump = Pump {
            broker: Arc::clone(&broker),
            control: control.clone(),
            drc_pid: drc_pid.clone(),
            state: state_tx,
            exit: exit_tx,
            events: events_tx,
            on_close: self.on_close,
            received: 0,
        };
        let pump = tokio::spawn(pump.run(stream::select_all(sources)));

        let request = SpawnRequest {
            drc_pid: drc_pid.clone(),
            binary: self.binary,
            args: self.args,
        };
        tracing::info!(
            drc_pid = %drc_pid,
            binary = %request.binary,
            args = ?request.args,
            "Requesting remote process"
        );
        let published = match encode(EventKind::SpawnProcess.tag(), &request) {
            Ok(wire) => broker.publish(&control, wire).await,
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            pump.abort();
            return Err(e.context("Failed to publish spawn request"));
        }

        Ok(RemoteProcess {
            drc_pid,
            channels,
            broker,
            state: state_rx,
            exit: exit_rx,
            events: events_rx,
            pump,
        })
    }
}

impl std::fmt::Debug for RemoteCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCommand")
            .field("binary", &self.binary)
            .field("args", &self.args)
            .field("on_close", &self.on_close.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
enum Source {
    Process(ProcessEvent),
    Stream(StreamName, StreamEvent),
}

fn tagged(subscription: Subscription, source: Source) -> BoxStream<'static, (Source, String)> {
    stream::unfold(subscription, move |mut subscription| async move {
        let delivery = subscription.recv().await?;
        Some(((source, delivery.payload), subscription))
    })
    .boxed()
}

fn parse<T: DeserializeOwned>(payload: &str) -> Result<T> {
    serde_json::from_str(payload).context("Malformed process event")
}

fn to_event(source: Source, payload: &str) -> Result<RemoteEvent> {
    Ok(match source {
        Source::Process(ProcessEvent::Spawn) => {
            let spawned: Spawned = parse(payload)?;
            RemoteEvent::Spawn { pid: spawned.pid }
        }
        Source::Process(ProcessEvent::Exit) => RemoteEvent::Exit(parse(payload)?),
        Source::Process(ProcessEvent::Error) => {
            let failure: ProcessFailure = parse(payload)?;
            RemoteEvent::Error(failure.message)
        }
        Source::Process(ProcessEvent::Disconnect) => RemoteEvent::Disconnect,
        Source::Process(ProcessEvent::Message) => RemoteEvent::Message(parse(payload)?),
        Source::Process(ProcessEvent::Close) => {
            let closed: ProcessClosed = parse(payload)?;
            RemoteEvent::Close(closed.exit)
        }
        Source::Stream(name, StreamEvent::Data) => {
            let bytes = parse::<Chunk>(payload)?.bytes()?;
            match name {
                StreamName::Stdout => RemoteEvent::Stdout(bytes),
                StreamName::Stderr => RemoteEvent::Stderr(bytes),
            }
        }
        Source::Stream(name, StreamEvent::Close) => RemoteEvent::StreamClosed(name),
    })
}

/// Owns the event subscriptions and drives the client state machine.
struct Pump {
    broker: Arc<dyn Broker>,
    control: String,
    drc_pid: String,
    state: watch::Sender<ProcessState>,
    exit: watch::Sender<Option<ProcessExit>>,
    events: mpsc::UnboundedSender<RemoteEvent>,
    on_close: Option<CloseHandler>,
    received: u64,
}

impl Pump {
    async fn run(mut self, mut sources: SelectAll<BoxStream<'static, (Source, String)>>) {
        let mut pending_close: Option<ProcessClosed> = None;

        while let Some((source, payload)) = sources.next().await {
            if let Source::Process(ProcessEvent::Close) = source {
                match parse::<ProcessClosed>(&payload) {
                    Ok(closed) => pending_close = Some(closed),
                    Err(e) => {
                        tracing::warn!(drc_pid = %self.drc_pid, error = %e, "Dropping malformed close event");
                        continue;
                    }
                }
            } else {
                self.received += 1;
                match to_event(source, &payload) {
                    Ok(event) => self.forward(event),
                    Err(e) => {
                        tracing::warn!(drc_pid = %self.drc_pid, source = ?source, error = %e, "Dropping malformed process event");
                    }
                }
            }

            if let Some(closed) = pending_close {
                if self.received >= closed.preceding {
                    drop(sources);
                    self.finish(closed.exit).await;
                    return;
                }
            }
        }
        tracing::warn!(drc_pid = %self.drc_pid, "Process event stream ended before close");
    }

    fn forward(&self, event: RemoteEvent) {
        if let RemoteEvent::Spawn { pid } = &event {
            tracing::debug!(drc_pid = %self.drc_pid, os_pid = ?pid, "Remote process running");
            self.state.send_replace(ProcessState::Running);
        }
        let _ = self.events.send(event);
    }

    /// Run the terminal handler, then acknowledge so the host may release.
    async fn finish(mut self, exit: ProcessExit) {
        self.state.send_replace(ProcessState::Closing);
        let _ = self.events.send(RemoteEvent::Close(exit));

        if let Some(handler) = self.on_close.take() {
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler(&exit))).is_err() {
                tracing::error!(drc_pid = %self.drc_pid, "Close handler panicked");
            }
        }

        let ack = AckClose {
            drc_pid: self.drc_pid.clone(),
        };
        let published = match encode(EventKind::ClientAckClose.tag(), &ack) {
            Ok(wire) => self.broker.publish(&self.control, wire).await,
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            tracing::warn!(drc_pid = %self.drc_pid, error = %e, "Failed to acknowledge close");
        }

        tracing::info!(drc_pid = %self.drc_pid, code = ?exit.code, signal = ?exit.signal, "Remote process closed");
        self.exit.send_replace(Some(exit));
        self.state.send_replace(ProcessState::Closed);
    }
}

/// Local stand-in for a process owned by the host daemon.
pub struct RemoteProcess {
    drc_pid: String,
    channels: ProcessChannels,
    broker: Arc<dyn Broker>,
    state: watch::Receiver<ProcessState>,
    exit: watch::Receiver<Option<ProcessExit>>,
    events: mpsc::UnboundedReceiver<RemoteEvent>,
    pump: JoinHandle<()>,
}

impl RemoteProcess {
    pub fn drc_pid(&self) -> &str {
        &self.drc_pid
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    /// Every event the host reported, ending with [`RemoteEvent::Close`].
    pub fn events(&mut self) -> &mut mpsc::UnboundedReceiver<RemoteEvent> {
        &mut self.events
    }

    /// Wait until the host has confirmed the spawn, returning the state
    /// reached by then. A rejected request never confirms.
    pub async fn spawned(&self) -> Result<ProcessState> {
        let mut state = self.state.clone();
        let reached = *state
            .wait_for(|s| *s >= ProcessState::Running)
            .await
            .map_err(|_| anyhow::anyhow!("Remote process {} lost its event stream", self.drc_pid))?;
        Ok(reached)
    }

    /// Wait until the host has started the process. Fails if it closed first.
    pub async fn running(&self) -> Result<()> {
        if self.spawned().await? != ProcessState::Running {
            anyhow::bail!("Remote process {} is no longer running", self.drc_pid);
        }
        Ok(())
    }

    /// Send bytes to the process's stdin. Waits for the host to confirm the
    /// spawn so the write cannot race its input subscription.
    pub async fn write(&self, data: impl AsRef<[u8]>) -> Result<()> {
        self.running().await?;
        self.send(InputAction::Write, &Chunk::from_bytes(data.as_ref())).await
    }

    /// Close the process's stdin.
    pub async fn end_input(&self) -> Result<()> {
        self.running().await?;
        self.send(InputAction::End, &serde_json::json!({})).await
    }

    pub async fn kill(&self) -> Result<()> {
        self.running().await?;
        self.send(InputAction::Kill, &serde_json::json!({})).await
    }

    async fn send<T: Serialize>(&self, action: InputAction, body: &T) -> Result<()> {
        let payload = serde_json::to_string(body)?;
        self.broker
            .publish(&self.channels.input(action), payload)
            .await
            .with_context(|| format!("Failed to send {} to {}", action.as_str(), self.drc_pid))
    }

    /// Wait for close; returns once the terminal handler has run and the
    /// acknowledgment has been sent.
    pub async fn wait(&self) -> Result<ProcessExit> {
        let mut exit = self.exit.clone();
        let exit = *exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| anyhow::anyhow!("Remote process {} ended without closing", self.drc_pid))?;
        exit.context("Close status missing")
    }

    /// Stop listening without acknowledging. The host keeps the process's
    /// resources until its acknowledgment timeout, if any.
    pub fn detach(self) {
        self.pump.abort();
    }
}

impl std::fmt::Debug for RemoteProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProcess")
            .field("drc_pid", &self.drc_pid)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drc_core::MemoryBroker;

    #[tokio::test]
    async fn test_spawn_publishes_request_on_control_channel() {
        let broker = MemoryBroker::new();
        let mut control = broker.subscribe_now("drc:__process");

        let remote = RemoteCommand::new("ls")
            .arg("-h")
            .spawn(Arc::new(broker.clone()), "drc", "__process")
            .await
            .unwrap();

        let delivery = control.try_recv().unwrap();
        let envelope = drc_core::decode(&delivery.payload).unwrap();
        assert_eq!(envelope.kind(), EventKind::SpawnProcess);
        let request: SpawnRequest = envelope.data_as().unwrap();
        assert_eq!(request.drc_pid, remote.drc_pid());
        assert_eq!(request.binary, "ls");
        assert_eq!(request.args, vec!["-h"]);
    }

    #[tokio::test]
    async fn test_close_waits_for_preceding_events() {
        let broker = MemoryBroker::new();
        let mut control = broker.subscribe_now("drc:__process");
        let mut remote = RemoteCommand::new("ls")
            .spawn(Arc::new(broker.clone()), "drc", "__process")
            .await
            .unwrap();
        let _ = control.try_recv();
        let channels = ProcessChannels::new("drc", "__process", remote.drc_pid());

        // Close overtakes the stdout chunk it was published after.
        let closed = ProcessClosed {
            exit: ProcessExit {
                code: Some(0),
                signal: None,
            },
            preceding: 2,
        };
        broker.deliver(
            &channels.process(ProcessEvent::Close),
            serde_json::to_string(&closed).unwrap(),
        );
        broker.deliver(
            &channels.process(ProcessEvent::Spawn),
            serde_json::to_string(&Spawned { pid: Some(7) }).unwrap(),
        );
        tokio::task::yield_now().await;
        assert_ne!(remote.state(), ProcessState::Closed);

        broker.deliver(
            &channels.stream(StreamName::Stdout, StreamEvent::Data),
            serde_json::to_string(&Chunk::from_bytes(b"late")).unwrap(),
        );
        let exit = remote.wait().await.unwrap();
        assert!(exit.success());
        assert_eq!(remote.state(), ProcessState::Closed);

        let mut seen = Vec::new();
        while let Ok(event) = remote.events().try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&RemoteEvent::Stdout(b"late".to_vec())));
        assert_eq!(seen.last(), Some(&RemoteEvent::Close(exit)));

        let ack = drc_core::decode(&control.try_recv().unwrap().payload).unwrap();
        assert_eq!(ack.kind(), EventKind::ClientAckClose);
    }
}
