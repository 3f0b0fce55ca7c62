// ABOUTME: Remote process control over the drc bus.
// ABOUTME: The host spawns and mirrors OS processes; clients drive them through RemoteProcess proxies.

pub mod channel;
pub mod client;
pub mod host;

pub use channel::{
    control_channel, InputAction, ProcessChannels, ProcessEvent, ProcessExit, SpawnRequest,
    StreamEvent, StreamName,
};
pub use client::{ProcessState, RemoteCommand, RemoteEvent, RemoteProcess};
pub use host::{HostSettings, ProcessHost, SpawnRejection};
