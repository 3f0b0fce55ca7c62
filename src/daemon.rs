// ABOUTME: The drc subcommands: TCP broker, privileged process host, remote spawn client, and bus watcher
// ABOUTME: Each runs until its work is done or the shared shutdown token fires

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use drc_core::{
    decode, serve_broker, Broker, BusRouter, Config, CorrelationRegistry, RosterService,
    TcpBroker,
};
use drc_process::{
    control_channel, HostSettings, ProcessExit, ProcessHost, ProcessState, RemoteCommand,
    RemoteEvent,
};

/// How long `drc spawn` waits for the host to confirm before giving up.
const SPAWN_CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);

/// Cancel `token` on Ctrl+C or SIGTERM.
pub fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
                        _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                    let _ = ctrl_c.await;
                    tracing::info!("Received Ctrl+C, shutting down");
                }
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            tracing::info!("Received Ctrl+C, shutting down");
        }

        token.cancel();
    });
}

pub async fn connect(config: &Config) -> Result<Arc<dyn Broker>> {
    let broker = TcpBroker::connect(config.bus.broker_addr.as_str())
        .await
        .with_context(|| format!("Failed to reach broker at {}", config.bus.broker_addr))?;
    Ok(Arc::new(broker))
}

/// `drc broker`: accept bus clients on `listen`.
pub async fn run_broker(listen: &str, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind broker on {}", listen))?;
    serve_broker(listener, shutdown).await
}

/// `drc host`: serve spawn requests and close acknowledgments on the
/// process control channel.
pub async fn run_host(config: &Config, shutdown: CancellationToken) -> Result<()> {
    let broker = connect(config).await?;
    let settings = HostSettings::from_config(config);
    if settings.allowed_binaries.is_empty() {
        tracing::warn!("No binaries are allow-listed; every spawn request will be rejected");
    }

    let host = ProcessHost::new(Arc::clone(&broker), settings);
    let router = Arc::new(host.attach(
        BusRouter::new(CorrelationRegistry::new()).ignore(config.bus.ignored_tags.clone()),
    ));
    let control = control_channel(&config.bus.topic, &config.process.marker);
    let subscription = broker.subscribe(&control).await?;

    tracing::info!(
        control = %control,
        allowed = ?host.settings().allowed_binaries,
        ack_timeout_secs = host.settings().ack_timeout.map(|t| t.as_secs()),
        "Process host ready"
    );
    router.serve(subscription, shutdown).await;

    let leftover = host.running();
    if !leftover.is_empty() {
        tracing::warn!(processes = ?leftover, "Shutting down with unreleased processes");
    }
    Ok(())
}

/// Exit code for the local process mirroring a remote one.
pub fn exit_code(exit: &ProcessExit) -> i32 {
    match (exit.code, exit.signal) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

/// `drc spawn`: run `binary` inside the host, forwarding local stdin and
/// printing its output. Returns the remote exit code.
pub async fn run_spawn(config: &Config, binary: &str, args: &[String]) -> Result<i32> {
    let broker = connect(config).await?;
    let mut remote = RemoteCommand::new(binary)
        .args(args.iter().cloned())
        .spawn(broker, &config.bus.topic, &config.process.marker)
        .await?;

    let confirmed = tokio::time::timeout(SPAWN_CONFIRM_TIMEOUT, remote.spawned()).await;
    match confirmed {
        Ok(state) => {
            let state = state?;
            tracing::debug!(drc_pid = %remote.drc_pid(), state = ?state, "Spawn confirmed");
        }
        Err(_) => anyhow::bail!(
            "Host did not start '{}' within {}s (is it allow-listed?)",
            binary,
            SPAWN_CONFIRM_TIMEOUT.as_secs()
        ),
    }

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let mut buf = vec![0u8; 8 * 1024];
    let mut forwarding = remote.state() == ProcessState::Running;

    let exit = loop {
        tokio::select! {
            read = stdin.read(&mut buf), if forwarding => {
                let sent = match read {
                    Ok(0) => remote.end_input().await.map(|_| false),
                    Ok(n) => remote.write(&buf[..n]).await.map(|_| true),
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to read local stdin");
                        remote.end_input().await.map(|_| false)
                    }
                };
                forwarding = sent.unwrap_or_else(|e| {
                    tracing::debug!(error = %e, "Stopped forwarding stdin");
                    false
                });
            }
            event = remote.events().recv() => match event {
                Some(RemoteEvent::Stdout(bytes)) => {
                    stdout.write_all(&bytes).await?;
                    stdout.flush().await?;
                }
                Some(RemoteEvent::Stderr(bytes)) => {
                    stderr.write_all(&bytes).await?;
                    stderr.flush().await?;
                }
                Some(RemoteEvent::Error(message)) => {
                    tracing::error!(drc_pid = %remote.drc_pid(), error = %message, "Remote process error");
                }
                Some(RemoteEvent::Close(exit)) => break exit,
                Some(other) => tracing::debug!(event = ?other, "Remote process event"),
                None => anyhow::bail!("Remote process event stream ended before close"),
            }
        }
    };

    // Returns once the acknowledgment is on its way to the host.
    remote.wait().await?;
    Ok(exit_code(&exit))
}

/// `drc watch`: log every envelope on the shared topic and keep a live
/// roster of every channel seen.
pub async fn run_watch(config: &Config, shutdown: CancellationToken) -> Result<()> {
    let broker = connect(config).await?;
    let roster = RosterService::new();
    let router = roster.attach(
        BusRouter::new(CorrelationRegistry::new()).ignore(config.bus.ignored_tags.clone()),
    );
    let mut subscription = broker.subscribe(&config.bus.topic).await?;
    tracing::info!(topic = %config.bus.topic, "Watching bus");

    loop {
        let delivery = tokio::select! {
            delivery = subscription.recv() => delivery,
            _ = shutdown.cancelled() => break,
        };
        let Some(delivery) = delivery else {
            tracing::warn!("Bus subscription ended");
            break;
        };
        match decode(&delivery.payload) {
            Ok(envelope) => {
                tracing::info!(
                    tag = %envelope.tag,
                    kind = ?envelope.kind(),
                    data = %envelope.data,
                    "Bus message"
                );
                router.route(envelope).await;
            }
            Err(_) => {
                // Logs and counts the decode failure.
                router.route_raw(&delivery.payload).await;
            }
        }
    }

    tracing::info!(roster = ?roster, "Watch stopped");
    Ok(())
}
