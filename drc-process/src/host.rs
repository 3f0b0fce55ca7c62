// ABOUTME: Host-side process manager: spawns allow-listed binaries and mirrors their lifecycle onto the bus.
// ABOUTME: A process's bus resources are held until the client acknowledges its close event.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use drc_core::{metrics, Broker, BusRouter, Config, Envelope, EventKind, Subscription};

use crate::channel::{
    AckClose, Chunk, InputAction, ProcessChannels, ProcessClosed, ProcessEvent, ProcessExit,
    ProcessFailure, SpawnRequest, Spawned, StreamEvent, StreamName,
};

const READ_CHUNK: usize = 8 * 1024;

/// Why a spawn request produced no running process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpawnRejection {
    #[error("binary not allowed: {0}")]
    BinaryNotAllowed(String),
    #[error("invalid drcPid '{0}'")]
    InvalidPid(String),
    #[error("process {0} is already running")]
    DuplicatePid(String),
    #[error("failed to start {binary}: {message}")]
    SpawnFailed { binary: String, message: String },
}

impl SpawnRejection {
    fn reason(&self) -> &'static str {
        match self {
            Self::BinaryNotAllowed(_) => "binary_not_allowed",
            Self::InvalidPid(_) => "invalid_pid",
            Self::DuplicatePid(_) => "duplicate_pid",
            Self::SpawnFailed { .. } => "spawn_failed",
        }
    }

    /// Refused before any process was created. These are routine and
    /// publish nothing.
    pub fn is_refusal(&self) -> bool {
        !matches!(self, Self::SpawnFailed { .. })
    }
}

#[derive(Debug, Clone)]
pub struct HostSettings {
    pub topic: String,
    pub marker: String,
    pub allowed_binaries: Vec<String>,
    /// Force-release a closed process after this long without an
    /// acknowledgment. `None` waits indefinitely.
    pub ack_timeout: Option<Duration>,
}

impl HostSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            topic: config.bus.topic.clone(),
            marker: config.process.marker.clone(),
            allowed_binaries: config.process.allowed_binaries.clone(),
            ack_timeout: config.process.ack_timeout(),
        }
    }
}

/// Publishes one process's events onto its sub-channels.
#[derive(Clone)]
struct Publisher {
    broker: Arc<dyn Broker>,
    channels: ProcessChannels,
    sent: Arc<AtomicU64>,
}

impl Publisher {
    fn new(broker: Arc<dyn Broker>, channels: ProcessChannels) -> Self {
        Self {
            broker,
            channels,
            sent: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish the terminal event, counting everything sent before it.
    async fn close(&self, exit: ProcessExit) {
        let closed = ProcessClosed {
            exit,
            preceding: self.sent.load(Ordering::SeqCst),
        };
        self.send(self.channels.process(ProcessEvent::Close), &closed).await;
    }

    async fn process<T: Serialize>(&self, event: ProcessEvent, body: &T) {
        self.send(self.channels.process(event), body).await;
    }

    async fn stream<T: Serialize>(&self, stream: StreamName, event: StreamEvent, body: &T) {
        self.send(self.channels.stream(stream, event), body).await;
    }

    async fn send<T: Serialize>(&self, channel: String, body: &T) {
        let payload = match serde_json::to_string(body) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(channel = %channel, error = %e, "Failed to serialize process event");
                return;
            }
        };
        match self.broker.publish(&channel, payload).await {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "Failed to publish process event");
            }
        }
    }
}

struct Record {
    generation: u64,
    os_pid: Option<u32>,
    closed: bool,
    tasks: Vec<JoinHandle<()>>,
}

impl Record {
    fn release(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

struct Inputs {
    write: Subscription,
    end: Subscription,
    kill: Subscription,
}

struct Inner {
    broker: Arc<dyn Broker>,
    settings: HostSettings,
    allowed: HashSet<String>,
    running: Mutex<HashMap<String, Record>>,
    generations: AtomicU64,
}

/// The privileged side of the remote process control plane.
#[derive(Clone)]
pub struct ProcessHost {
    inner: Arc<Inner>,
}

impl ProcessHost {
    pub fn new(broker: Arc<dyn Broker>, settings: HostSettings) -> Self {
        let allowed = settings.allowed_binaries.iter().cloned().collect();
        Self {
            inner: Arc::new(Inner {
                broker,
                settings,
                allowed,
                running: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
        }
    }

    pub fn settings(&self) -> &HostSettings {
        &self.inner.settings
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, Record>> {
        self.inner.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// drcPids whose resources are still held, sorted.
    pub fn running(&self) -> Vec<String> {
        let mut pids: Vec<String> = self.records().keys().cloned().collect();
        pids.sort();
        pids
    }

    pub fn is_running(&self, drc_pid: &str) -> bool {
        self.records().contains_key(drc_pid)
    }

    pub fn os_pid(&self, drc_pid: &str) -> Option<u32> {
        self.records().get(drc_pid)?.os_pid
    }

    fn validate(&self, request: &SpawnRequest) -> Result<(), SpawnRejection> {
        if !self.inner.allowed.contains(&request.binary) {
            return Err(SpawnRejection::BinaryNotAllowed(request.binary.clone()));
        }
        if request.drc_pid.is_empty() || request.drc_pid.contains(':') {
            return Err(SpawnRejection::InvalidPid(request.drc_pid.clone()));
        }
        Ok(())
    }

    /// Reserve the table slot for `drc_pid`, refusing duplicates.
    fn reserve(&self, drc_pid: &str) -> Result<u64, SpawnRejection> {
        let mut records = self.records();
        if records.contains_key(drc_pid) {
            return Err(SpawnRejection::DuplicatePid(drc_pid.to_string()));
        }
        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
        records.insert(
            drc_pid.to_string(),
            Record {
                generation,
                os_pid: None,
                closed: false,
                tasks: Vec::new(),
            },
        );
        metrics::set_running_processes(records.len());
        Ok(generation)
    }

    fn unreserve(&self, drc_pid: &str) {
        let mut records = self.records();
        if let Some(record) = records.remove(drc_pid) {
            record.release();
        }
        metrics::set_running_processes(records.len());
    }

    /// Start the process described by `request` and begin forwarding its
    /// events. Validation failures publish nothing on the process's
    /// sub-channels.
    pub async fn spawn(&self, request: SpawnRequest) -> Result<Option<u32>, SpawnRejection> {
        let result = self.start(request).await;
        if let Err(rejection) = &result {
            metrics::record_spawn_rejected(rejection.reason());
        }
        result
    }

    async fn start(&self, request: SpawnRequest) -> Result<Option<u32>, SpawnRejection> {
        self.validate(&request)?;
        let SpawnRequest {
            drc_pid,
            binary,
            args,
        } = request;
        let generation = self.reserve(&drc_pid)?;

        let channels = ProcessChannels::new(
            &self.inner.settings.topic,
            &self.inner.settings.marker,
            &drc_pid,
        );
        let publisher = Publisher::new(Arc::clone(&self.inner.broker), channels.clone());

        // Listen for input before announcing the process so nothing the
        // client sends after `spawn` is missed.
        let inputs = match self.subscribe_inputs(&channels).await {
            Ok(inputs) => inputs,
            Err(e) => {
                self.unreserve(&drc_pid);
                return Err(SpawnRejection::SpawnFailed {
                    binary,
                    message: format!("{e:#}"),
                });
            }
        };

        let spawned = Command::new(&binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let message = e.to_string();
                tracing::warn!(drc_pid = %drc_pid, binary = %binary, error = %message, "Failed to start remote process");
                // The client is already listening; tell it the process is gone.
                publisher
                    .process(ProcessEvent::Error, &ProcessFailure { message: message.clone() })
                    .await;
                publisher.close(ProcessExit::default()).await;
                self.mark_closed(&drc_pid, generation);
                return Err(SpawnRejection::SpawnFailed { binary, message });
            }
        };

        let os_pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();

        let input_task = tokio::spawn(pump_input(inputs, stdin, kill_tx, drc_pid.clone()));
        publisher.process(ProcessEvent::Spawn, &Spawned { pid: os_pid }).await;

        let mut streams = Vec::new();
        if let Some(stdout) = stdout {
            streams.push(tokio::spawn(forward_stream(publisher.clone(), StreamName::Stdout, stdout)));
        }
        if let Some(stderr) = stderr {
            streams.push(tokio::spawn(forward_stream(publisher.clone(), StreamName::Stderr, stderr)));
        }
        let supervisor = tokio::spawn(self.clone().supervise(
            child,
            kill_rx,
            publisher,
            streams,
            generation,
        ));

        let mut tasks = vec![input_task, supervisor];
        {
            let mut records = self.records();
            if let Some(record) = records
                .get_mut(&drc_pid)
                .filter(|r| r.generation == generation)
            {
                record.os_pid = os_pid;
                record.tasks.append(&mut tasks);
            }
        }
        // Released before the tasks could be attached.
        for task in tasks {
            task.abort();
        }

        tracing::info!(
            drc_pid = %drc_pid,
            binary = %binary,
            args = ?args,
            os_pid = ?os_pid,
            "Remote process started"
        );
        Ok(os_pid)
    }

    async fn subscribe_inputs(&self, channels: &ProcessChannels) -> anyhow::Result<Inputs> {
        let broker = &self.inner.broker;
        Ok(Inputs {
            write: broker.subscribe(&channels.input(InputAction::Write)).await?,
            end: broker.subscribe(&channels.input(InputAction::End)).await?,
            kill: broker.subscribe(&channels.input(InputAction::Kill)).await?,
        })
    }

    /// Wait for exit, drain both streams, then publish `close`.
    async fn supervise(
        self,
        mut child: Child,
        mut kill_rx: mpsc::UnboundedReceiver<()>,
        publisher: Publisher,
        streams: Vec<JoinHandle<()>>,
        generation: u64,
    ) {
        let drc_pid = publisher.channels.drc_pid().to_string();
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                Some(()) = kill_rx.recv() => {
                    tracing::info!(drc_pid = %drc_pid, "Killing remote process");
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(drc_pid = %drc_pid, error = %e, "Failed to kill remote process");
                    }
                }
            }
        };

        let exit = match status {
            Ok(status) => {
                let exit = ProcessExit::from(status);
                publisher.process(ProcessEvent::Exit, &exit).await;
                exit
            }
            Err(e) => {
                tracing::error!(drc_pid = %drc_pid, error = %e, "Failed to wait on remote process");
                publisher
                    .process(ProcessEvent::Error, &ProcessFailure { message: e.to_string() })
                    .await;
                ProcessExit::default()
            }
        };

        for stream in streams {
            if let Err(e) = stream.await {
                tracing::warn!(drc_pid = %drc_pid, error = %e, "Stream forwarder did not finish cleanly");
            }
        }

        publisher.close(exit).await;
        tracing::info!(
            drc_pid = %drc_pid,
            code = ?exit.code,
            signal = ?exit.signal,
            "Remote process closed, awaiting client acknowledgment"
        );
        self.mark_closed(&drc_pid, generation);
    }

    fn mark_closed(&self, drc_pid: &str, generation: u64) {
        if let Some(record) = self.records().get_mut(drc_pid) {
            record.closed = true;
        }
        let Some(timeout) = self.inner.settings.ack_timeout else {
            return;
        };
        let host = self.clone();
        let drc_pid = drc_pid.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            host.expire(&drc_pid, generation, timeout);
        });
    }

    fn expire(&self, drc_pid: &str, generation: u64, timeout: Duration) {
        let mut records = self.records();
        if records.get(drc_pid).map(|r| r.generation) != Some(generation) {
            return;
        }
        if let Some(record) = records.remove(drc_pid) {
            record.release();
        }
        metrics::set_running_processes(records.len());
        metrics::record_ack_timeout();
        tracing::warn!(
            drc_pid = %drc_pid,
            timeout_secs = timeout.as_secs(),
            "Client never acknowledged close; force-released process resources"
        );
    }

    /// Release everything held for `drc_pid`. Returns false when nothing was held.
    pub fn acknowledge_close(&self, drc_pid: &str) -> bool {
        let (record, remaining) = {
            let mut records = self.records();
            let record = records.remove(drc_pid);
            (record, records.len())
        };
        let Some(record) = record else {
            tracing::debug!(drc_pid = %drc_pid, "Close acknowledgment for unknown process");
            return false;
        };
        if !record.closed {
            tracing::warn!(drc_pid = %drc_pid, "Acknowledgment arrived before close; terminating process");
        }
        record.release();
        metrics::set_running_processes(remaining);
        tracing::info!(drc_pid = %drc_pid, "Released remote process resources");
        true
    }

    /// Register `spawnProcess` and `clientAckClose` handlers on `router`.
    pub fn attach(&self, router: BusRouter) -> BusRouter {
        let spawner = self.clone();
        let acknowledger = self.clone();
        router
            .on(EventKind::SpawnProcess.tag(), move |envelope: Envelope| {
                let host = spawner.clone();
                async move {
                    let request: SpawnRequest = envelope.data_as()?;
                    match host.spawn(request).await {
                        Err(rejection) if rejection.is_refusal() => {
                            tracing::warn!(reason = rejection.reason(), error = %rejection, "Spawn request refused");
                            Ok(())
                        }
                        result => result.map(|_| ()).map_err(anyhow::Error::from),
                    }
                }
            })
            .on(EventKind::ClientAckClose.tag(), move |envelope: Envelope| {
                let host = acknowledger.clone();
                async move {
                    let ack: AckClose = envelope.data_as()?;
                    host.acknowledge_close(&ack.drc_pid);
                    anyhow::Ok(())
                }
            })
    }
}

impl std::fmt::Debug for ProcessHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHost")
            .field("settings", &self.inner.settings)
            .field("running", &self.running())
            .finish()
    }
}

/// Apply input actions to the child until the record is released.
async fn pump_input(
    mut inputs: Inputs,
    mut stdin: Option<ChildStdin>,
    kill_tx: mpsc::UnboundedSender<()>,
    drc_pid: String,
) {
    loop {
        // Queued writes go before a pending end.
        tokio::select! {
            biased;
            Some(delivery) = inputs.write.recv() => {
                let bytes = match serde_json::from_str::<Chunk>(&delivery.payload)
                    .map_err(anyhow::Error::from)
                    .and_then(|chunk| chunk.bytes())
                {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        tracing::warn!(drc_pid = %drc_pid, error = %e, "Dropping malformed input chunk");
                        continue;
                    }
                };
                let Some(pipe) = stdin.as_mut() else {
                    tracing::debug!(drc_pid = %drc_pid, "Input after stdin was closed");
                    continue;
                };
                let written = async {
                    pipe.write_all(&bytes).await?;
                    pipe.flush().await
                }
                .await;
                if let Err(e) = written {
                    tracing::warn!(drc_pid = %drc_pid, error = %e, "Failed to write to remote process stdin");
                    stdin = None;
                }
            }
            Some(_) = inputs.end.recv() => {
                if stdin.take().is_some() {
                    tracing::debug!(drc_pid = %drc_pid, "Closed remote process stdin");
                }
            }
            Some(_) = inputs.kill.recv() => {
                let _ = kill_tx.send(());
            }
            else => break,
        }
    }
}

async fn forward_stream<R>(publisher: Publisher, stream: StreamName, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                publisher
                    .stream(stream, StreamEvent::Data, &Chunk::from_bytes(&buf[..n]))
                    .await;
            }
            Err(e) => {
                tracing::warn!(
                    drc_pid = %publisher.channels.drc_pid(),
                    stream = stream.as_str(),
                    error = %e,
                    "Failed to read remote process output"
                );
                break;
            }
        }
    }
    publisher
        .stream(stream, StreamEvent::Close, &serde_json::json!({}))
        .await;
}
