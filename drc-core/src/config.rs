// ABOUTME: Configuration parsing from TOML file with environment variable overrides
// ABOUTME: Covers bus topic/broker, process allow-list, flood spacing, metrics and logging
use crate::paths;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub flood: FloodConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Shared topic every daemon subscribes to
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Broker address (host:port)
    #[serde(default = "default_broker_addr")]
    pub broker_addr: String,
    /// Tags that are known but deliberately unhandled (suppresses warnings)
    #[serde(default)]
    pub ignored_tags: Vec<String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            broker_addr: default_broker_addr(),
            ignored_tags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Namespace segment for remote-process sub-channels
    #[serde(default = "default_marker")]
    pub marker: String,
    /// Binaries the host may spawn. Empty means nothing is allowed.
    #[serde(default)]
    pub allowed_binaries: Vec<String>,
    /// How long the host waits for a client's close acknowledgment before
    /// force-releasing the process. Unset waits indefinitely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_timeout_secs: Option<u64>,
}

impl ProcessConfig {
    pub fn ack_timeout(&self) -> Option<Duration> {
        self.ack_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            marker: default_marker(),
            allowed_binaries: Vec::new(),
            ack_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FloodConfig {
    /// Minimum spacing between the starts of flood-governed operations
    #[serde(default = "default_flood_delay_ms")]
    pub delay_ms: u64,
}

impl FloodConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            delay_ms: default_flood_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Port for /metrics and /health; disabled when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default = "default_metrics_host")]
    pub host: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: None,
            host: default_metrics_host(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Also write JSON logs to a daily rolling file
    #[serde(default)]
    pub file: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
}

impl LoggingConfig {
    pub fn log_dir(&self) -> PathBuf {
        self.directory
            .as_deref()
            .map(|d| PathBuf::from(expand_tilde(d)))
            .unwrap_or_else(paths::log_dir)
    }
}

fn default_topic() -> String {
    "drc".to_string()
}

fn default_broker_addr() -> String {
    "127.0.0.1:6390".to_string()
}

fn default_marker() -> String {
    "__process".to_string()
}

fn default_flood_delay_ms() -> u64 {
    1000
}

fn default_metrics_host() -> String {
    "127.0.0.1".to_string()
}

/// Expand tilde (~) to home directory in paths
fn expand_tilde(path: &str) -> String {
    let home = || directories::BaseDirs::new().map(|b| b.home_dir().to_path_buf());
    if let Some(stripped) = path.strip_prefix("~/") {
        match home() {
            Some(home) => return home.join(stripped).to_string_lossy().to_string(),
            None => tracing::warn!(
                path = %path,
                "Failed to expand tilde in path: could not determine home directory"
            ),
        }
    } else if path == "~" {
        match home() {
            Some(home) => return home.to_string_lossy().to_string(),
            None => tracing::warn!("Failed to expand tilde: could not determine home directory"),
        }
    }
    path.to_string()
}

fn split_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    /// Find the config file, checking multiple locations in order:
    /// 1. DRC_CONFIG_PATH env var (if set)
    /// 2. ./config.toml (current directory - for development)
    /// 3. ~/.config/drc/config.toml (XDG config dir)
    fn find_config_file() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var("DRC_CONFIG_PATH") {
            let path = PathBuf::from(&env_path);
            if path.exists() {
                return Some(path);
            }
        }

        let local_config = PathBuf::from("config.toml");
        if local_config.exists() {
            return Some(local_config);
        }

        let xdg_config = paths::config_file();
        if xdg_config.exists() {
            return Some(xdg_config);
        }

        None
    }

    /// Load configuration from the first config file found, then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let mut config = match Self::find_config_file() {
            Some(path) => Self::read_file(&path)?,
            None => {
                tracing::info!("No config file found, using environment variables and defaults");
                Config::default()
            }
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit file, then apply environment overrides and validate.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = Self::read_file(path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading configuration from file");
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str::<Config>(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(val) = std::env::var("DRC_TOPIC") {
            self.bus.topic = val;
        }
        if let Ok(val) = std::env::var("DRC_BROKER_ADDR") {
            self.bus.broker_addr = val;
        }
        if let Ok(val) = std::env::var("DRC_IGNORED_TAGS") {
            self.bus.ignored_tags = split_list(&val);
        }
        if let Ok(val) = std::env::var("DRC_PROCESS_MARKER") {
            self.process.marker = val;
        }
        if let Ok(val) = std::env::var("DRC_ALLOWED_BINARIES") {
            self.process.allowed_binaries = split_list(&val);
        }
        if let Ok(val) = std::env::var("DRC_ACK_TIMEOUT_SECS") {
            self.process.ack_timeout_secs = Some(val.parse().with_context(|| {
                format!("DRC_ACK_TIMEOUT_SECS must be a number of seconds, got: {}", val)
            })?);
        }
        if let Ok(val) = std::env::var("DRC_FLOOD_DELAY_MS") {
            self.flood.delay_ms = val.parse().with_context(|| {
                format!("DRC_FLOOD_DELAY_MS must be a number of milliseconds, got: {}", val)
            })?;
        }
        if let Ok(val) = std::env::var("DRC_METRICS_PORT") {
            self.metrics.port = Some(val.parse().with_context(|| {
                format!("DRC_METRICS_PORT must be a valid port number, got: {}", val)
            })?);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.bus.topic.trim().is_empty() {
            anyhow::bail!("bus.topic must not be empty");
        }
        if self.bus.broker_addr.trim().is_empty() {
            anyhow::bail!("bus.broker_addr must not be empty");
        }
        if self.process.marker.is_empty() || self.process.marker.contains(':') {
            anyhow::bail!(
                "process.marker must be a non-empty name without ':', got '{}'",
                self.process.marker
            );
        }
        if let Some(bad) = self
            .process
            .allowed_binaries
            .iter()
            .find(|b| b.trim().is_empty())
        {
            anyhow::bail!("process.allowed_binaries contains an empty entry: '{}'", bad);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ENV_KEYS: &[&str] = &[
        "DRC_CONFIG_PATH",
        "DRC_TOPIC",
        "DRC_BROKER_ADDR",
        "DRC_IGNORED_TAGS",
        "DRC_PROCESS_MARKER",
        "DRC_ALLOWED_BINARIES",
        "DRC_ACK_TIMEOUT_SECS",
        "DRC_FLOOD_DELAY_MS",
        "DRC_METRICS_PORT",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.bus.topic, "drc");
        assert_eq!(config.process.marker, "__process");
        assert!(config.process.allowed_binaries.is_empty());
        assert_eq!(config.process.ack_timeout(), None);
        assert_eq!(config.flood.delay(), Duration::from_secs(1));
        assert!(config.metrics.port.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_file() {
        let config: Config = toml::from_str(
            r#"
                [bus]
                topic = "bridge"
                ignored_tags = ["discord:typing"]

                [process]
                allowed_binaries = ["echo", "ls"]
                ack_timeout_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.bus.topic, "bridge");
        assert_eq!(config.bus.broker_addr, "127.0.0.1:6390");
        assert_eq!(config.bus.ignored_tags, vec!["discord:typing"]);
        assert_eq!(config.process.allowed_binaries, vec!["echo", "ls"]);
        assert_eq!(config.process.ack_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.flood.delay_ms, 1000);
    }

    #[test]
    fn test_validate_rejects_bad_marker() {
        let mut config = Config::default();
        config.process.marker = "a:b".to_string();
        assert!(config.validate().is_err());
        config.process.marker = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_load_with_env_overrides() {
        clear_env();
        let tmpdir = tempfile::tempdir().unwrap();
        let path = tmpdir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
                [bus]
                topic = "from-file"

                [process]
                allowed_binaries = ["echo"]
            "#,
        )
        .unwrap();

        std::env::set_var("DRC_CONFIG_PATH", &path);
        std::env::set_var("DRC_BROKER_ADDR", "10.0.0.5:7000");
        std::env::set_var("DRC_ALLOWED_BINARIES", "ls, cat ,");
        std::env::set_var("DRC_METRICS_PORT", "9100");

        let config = Config::load().unwrap();
        assert_eq!(config.bus.topic, "from-file");
        assert_eq!(config.bus.broker_addr, "10.0.0.5:7000");
        assert_eq!(config.process.allowed_binaries, vec!["ls", "cat"]);
        assert_eq!(config.metrics.port, Some(9100));

        std::env::set_var("DRC_FLOOD_DELAY_MS", "soon");
        let err = Config::load().unwrap_err();
        assert!(format!("{err:#}").contains("DRC_FLOOD_DELAY_MS"));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_load_from_reports_parse_errors() {
        clear_env();
        let tmpdir = tempfile::tempdir().unwrap();
        let path = tmpdir.path().join("broken.toml");
        std::fs::write(&path, "[bus\ntopic = ").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse"));
    }

    #[test]
    fn test_logging_dir_override() {
        let logging = LoggingConfig {
            file: true,
            directory: Some("/var/log/drc".to_string()),
        };
        assert_eq!(logging.log_dir(), PathBuf::from("/var/log/drc"));
    }
}
