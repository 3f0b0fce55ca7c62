// ABOUTME: Main entry point for the drc daemons and tools
// ABOUTME: Parses the CLI, loads config, initializes logging and metrics, then runs one subcommand

use anyhow::Result;
use clap::{Parser, Subcommand};
use drc::{daemon, logging, metrics, metrics_server, Config};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "drc")]
#[command(about = "Bus coordination daemons for the drc chat bridge")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the TCP broker every daemon connects to
    Broker {
        /// Address to listen on (defaults to bus.broker_addr)
        #[arg(long, value_name = "ADDR")]
        listen: Option<String>,
    },
    /// Run the privileged process host
    Host,
    /// Run a binary inside the host, streaming its output here
    Spawn {
        binary: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Log every envelope on the shared topic
    Watch,
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Log panics before they take the process down
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("drc panicked: {}", panic_info);
        eprintln!("{:?}", std::backtrace::Backtrace::force_capture());
    }));

    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    let _log_guard = logging::init(cli.verbose, &config.logging)?;

    tracing::info!(
        topic = %config.bus.topic,
        broker = %config.bus.broker_addr,
        marker = %config.process.marker,
        metrics_port = ?config.metrics.port,
        "Configuration loaded"
    );

    let shutdown = CancellationToken::new();
    daemon::cancel_on_signal(shutdown.clone());

    if let Some(port) = config.metrics.port {
        let handle = metrics::init_metrics()?;
        let host = config.metrics.host.clone();
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics_server::serve(&host, port, handle, token).await {
                tracing::error!(error = format!("{e:#}"), "Metrics server stopped");
            }
        });
    }

    match cli.command {
        Command::Broker { listen } => {
            let listen = listen.unwrap_or_else(|| config.bus.broker_addr.clone());
            daemon::run_broker(&listen, shutdown).await
        }
        Command::Host => daemon::run_host(&config, shutdown).await,
        Command::Spawn { binary, args } => {
            let code = tokio::select! {
                code = daemon::run_spawn(&config, &binary, &args) => code?,
                _ = shutdown.cancelled() => 130,
            };
            std::process::exit(code);
        }
        Command::Watch => daemon::run_watch(&config, shutdown).await,
    }
}
