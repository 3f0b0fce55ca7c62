// ABOUTME: Per-process sub-channel naming and the JSON payloads carried on them.
// ABOUTME: Names follow <topic>:<marker>:<drcPid>[:<stream>]:<event>; stream bytes travel base64-encoded.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Lifecycle events published for the process itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessEvent {
    Disconnect,
    Close,
    Error,
    Exit,
    Message,
    Spawn,
}

impl ProcessEvent {
    pub const ALL: [ProcessEvent; 6] = [
        Self::Disconnect,
        Self::Close,
        Self::Error,
        Self::Exit,
        Self::Message,
        Self::Spawn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnect => "disconnect",
            Self::Close => "close",
            Self::Error => "error",
            Self::Exit => "exit",
            Self::Message => "message",
            Self::Spawn => "spawn",
        }
    }
}

/// Events published for each standard output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamEvent {
    Data,
    Close,
}

impl StreamEvent {
    pub const ALL: [StreamEvent; 2] = [Self::Data, Self::Close];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Close => "close",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamName {
    Stdout,
    Stderr,
}

impl StreamName {
    pub const ALL: [StreamName; 2] = [Self::Stdout, Self::Stderr];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Client -> host input actions, each on its own sub-channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputAction {
    Write,
    End,
    Kill,
}

impl InputAction {
    pub const ALL: [InputAction; 3] = [Self::Write, Self::End, Self::Kill];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Write => "write",
            Self::End => "end",
            Self::Kill => "kill",
        }
    }
}

/// `<topic>:<marker>`, where spawn requests and close acknowledgments travel.
pub fn control_channel(topic: &str, marker: &str) -> String {
    format!("{topic}:{marker}")
}

/// Sub-channel names for one remote process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessChannels {
    base: String,
    drc_pid: String,
}

impl ProcessChannels {
    pub fn new(topic: &str, marker: &str, drc_pid: &str) -> Self {
        Self {
            base: format!("{}:{drc_pid}", control_channel(topic, marker)),
            drc_pid: drc_pid.to_string(),
        }
    }

    pub fn drc_pid(&self) -> &str {
        &self.drc_pid
    }

    pub fn process(&self, event: ProcessEvent) -> String {
        format!("{}:{}", self.base, event.as_str())
    }

    pub fn stream(&self, stream: StreamName, event: StreamEvent) -> String {
        format!("{}:{}:{}", self.base, stream.as_str(), event.as_str())
    }

    pub fn input(&self, action: InputAction) -> String {
        format!("{}:{}", self.base, action.as_str())
    }
}

/// Body of a `spawnProcess` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnRequest {
    pub drc_pid: String,
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Body of a `clientAckClose` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckClose {
    pub drc_pid: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spawned {
    pub pid: Option<u32>,
}

/// Exit status carried by `exit` and `close`. A process killed by a signal
/// has no code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ProcessExit {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Body of the process `close` event. `preceding` counts the events the
/// host published for this process before it; the broker does not order
/// across sub-channels, so a client finishes only once it has seen them all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessClosed {
    #[serde(flatten)]
    pub exit: ProcessExit,
    pub preceding: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessFailure {
    pub message: String,
}

/// A chunk of raw bytes on a stream or input channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk: String,
}

impl Chunk {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            chunk: STANDARD.encode(bytes),
        }
    }

    pub fn bytes(&self) -> Result<Vec<u8>> {
        STANDARD
            .decode(&self.chunk)
            .context("Chunk is not valid base64")
    }
}
