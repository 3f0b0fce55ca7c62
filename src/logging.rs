// ABOUTME: Tracing setup: env-filtered console output plus an optional JSON rolling log file
// ABOUTME: Console goes to stderr so `drc spawn` can pass remote stdout through untouched

use anyhow::{Context, Result};
use drc_core::config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "drc.log";

/// Keeps the file writer flushing; hold it for the life of the process.
pub struct LogGuard {
    _file: Option<WorkerGuard>,
}

fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "info"
    }
}

pub fn init(verbose: bool, logging: &LoggingConfig) -> Result<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let (file_layer, guard) = if logging.file {
        let dir = logging.log_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
        let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("Failed to initialize logging")?;

    if logging.file {
        tracing::info!(dir = %logging.log_dir().display(), "Writing JSON logs to file");
    }
    Ok(LogGuard { _file: guard })
}
