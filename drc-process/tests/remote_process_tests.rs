// ABOUTME: End-to-end tests for remote process control over an in-memory broker
// ABOUTME: A host router serves the control channel while RemoteProcess proxies drive real OS processes

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use drc_core::{BusRouter, CorrelationRegistry, MemoryBroker};
use drc_process::{
    control_channel, HostSettings, ProcessHost, ProcessState, RemoteCommand, RemoteEvent,
    RemoteProcess,
};
use tokio_util::sync::CancellationToken;

const TOPIC: &str = "drc";
const MARKER: &str = "__process";

struct Harness {
    broker: MemoryBroker,
    host: ProcessHost,
    shutdown: CancellationToken,
}

impl Harness {
    fn start(ack_timeout: Option<Duration>) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let broker = MemoryBroker::new();
        let settings = HostSettings {
            topic: TOPIC.to_string(),
            marker: MARKER.to_string(),
            allowed_binaries: ["echo", "sh", "cat", "sleep"]
                .iter()
                .map(|b| b.to_string())
                .collect(),
            ack_timeout,
        };
        let host = ProcessHost::new(Arc::new(broker.clone()), settings);
        let router = Arc::new(host.attach(BusRouter::new(CorrelationRegistry::new())));
        let control = broker.subscribe_now(&control_channel(TOPIC, MARKER));
        let shutdown = CancellationToken::new();
        tokio::spawn(router.serve(control, shutdown.clone()));
        Self {
            broker,
            host,
            shutdown,
        }
    }

    async fn spawn(&self, command: RemoteCommand) -> RemoteProcess {
        command
            .spawn(Arc::new(self.broker.clone()), TOPIC, MARKER)
            .await
            .expect("spawn request should publish")
    }

    async fn wait_until_released(&self) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !self.host.running().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("host never released the process");
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Drain events up to and including close; returns (stdout, events).
async fn drain(remote: &mut RemoteProcess) -> (Vec<u8>, Vec<RemoteEvent>) {
    let mut stdout = Vec::new();
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), remote.events().recv())
            .await
            .expect("timed out waiting for process events")
            .expect("event stream ended before close");
        if let RemoteEvent::Stdout(bytes) = &event {
            stdout.extend_from_slice(bytes);
        }
        let done = matches!(event, RemoteEvent::Close(_));
        events.push(event);
        if done {
            return (stdout, events);
        }
    }
}

// =============================================================================
// SCENARIO: Allowed binary runs, streams output, and is released only after ack
// =============================================================================
#[tokio::test]
async fn scenario_allowed_binary_full_lifecycle() {
    let harness = Harness::start(None);
    let closes = Arc::new(AtomicUsize::new(0));
    let held_during_close = Arc::new(AtomicUsize::new(0));

    let command = {
        let closes = Arc::clone(&closes);
        let held = Arc::clone(&held_during_close);
        let host = harness.host.clone();
        RemoteCommand::new("echo").arg("-h").on_close(move |_exit| {
            closes.fetch_add(1, Ordering::SeqCst);
            held.store(host.running().len(), Ordering::SeqCst);
        })
    };
    let mut remote = harness.spawn(command).await;

    let (stdout, events) = drain(&mut remote).await;
    assert_eq!(String::from_utf8(stdout).unwrap(), "-h\n");
    assert!(events.iter().any(|e| matches!(e, RemoteEvent::Spawn { pid: Some(_) })));
    assert!(events.iter().any(|e| matches!(e, RemoteEvent::Exit(exit) if exit.success())));

    let exit = remote.wait().await.unwrap();
    assert!(exit.success());
    assert_eq!(remote.state(), ProcessState::Closed);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    // The terminal handler ran while the host held exactly this process.
    assert_eq!(held_during_close.load(Ordering::SeqCst), 1);

    harness.wait_until_released().await;
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

// =============================================================================
// SCENARIO: Releasing a process leaves no broker subscriptions behind
// =============================================================================
#[tokio::test]
async fn scenario_release_frees_broker_subscriptions() {
    let harness = Harness::start(None);
    let baseline = harness.broker.topics();

    let mut remote = harness.spawn(RemoteCommand::new("echo").arg("bye")).await;
    let drc_pid = remote.drc_pid().to_string();
    drain(&mut remote).await;
    remote.wait().await.unwrap();
    harness.wait_until_released().await;

    // Aborted host tasks drop their subscriptions on their next poll.
    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.broker.topics().iter().any(|t| t.contains(&drc_pid)) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("process sub-channels still subscribed after release");
    assert_eq!(harness.broker.topics(), baseline);
}

// =============================================================================
// SCENARIO: Stdout chunks arrive in emission order
// =============================================================================
#[tokio::test]
async fn scenario_stdout_arrives_in_order() {
    let harness = Harness::start(None);
    let script = "for i in $(seq 1 200); do echo line$i; done";
    let mut remote = harness
        .spawn(RemoteCommand::new("sh").args(["-c", script]))
        .await;

    let (stdout, _) = drain(&mut remote).await;
    let expected: String = (1..=200).map(|i| format!("line{i}\n")).collect();
    assert_eq!(String::from_utf8(stdout).unwrap(), expected);
    harness.wait_until_released().await;
}

// =============================================================================
// SCENARIO: Disallowed binary creates nothing and publishes nothing
// =============================================================================
#[tokio::test]
async fn scenario_disallowed_binary_is_silent() {
    let harness = Harness::start(None);
    let mut remote = harness.spawn(RemoteCommand::new("rm").arg("-rf")).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(harness.host.running().is_empty());
    assert!(remote.events().try_recv().is_err());
    assert_eq!(remote.state(), ProcessState::Spawning);
}

// =============================================================================
// SCENARIO: Input written by the client reaches the process's stdin
// =============================================================================
#[tokio::test]
async fn scenario_write_and_end_input() {
    let harness = Harness::start(None);
    let mut remote = harness.spawn(RemoteCommand::new("cat")).await;

    remote.write("hello ").await.unwrap();
    remote.write(b"world\n").await.unwrap();
    remote.end_input().await.unwrap();

    let (stdout, _) = drain(&mut remote).await;
    assert_eq!(stdout, b"hello world\n");
    assert!(remote.wait().await.unwrap().success());
    harness.wait_until_released().await;
}

// =============================================================================
// SCENARIO: Kill terminates a long-running process
// =============================================================================
#[tokio::test]
async fn scenario_kill_long_running_process() {
    let harness = Harness::start(None);
    let mut remote = harness.spawn(RemoteCommand::new("sleep").arg("30")).await;

    remote.kill().await.unwrap();
    let (_, events) = drain(&mut remote).await;
    let Some(RemoteEvent::Close(exit)) = events.last() else {
        panic!("expected close last, got {events:?}");
    };
    assert!(!exit.success());
    assert_eq!(exit.code, None);
    assert!(remote.write("late").await.is_err());
    harness.wait_until_released().await;
}

// =============================================================================
// SCENARIO: A client that never acknowledges is force-released after the timeout
// =============================================================================
#[tokio::test]
async fn scenario_unacknowledged_close_times_out() {
    let harness = Harness::start(Some(Duration::from_millis(100)));
    let remote = harness.spawn(RemoteCommand::new("sleep").arg("1")).await;
    remote.running().await.unwrap();
    let drc_pid = remote.drc_pid().to_string();
    remote.detach();

    assert!(harness.host.is_running(&drc_pid));
    harness.wait_until_released().await;
}
