//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `host.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - ServerConfig: Listen address and static asset directory.
//!     - PollingConfig: How often devices are sampled.
//!     - SubscribersConfig: Per-connection queue depth.
//!     - HistoryConfig: How many snapshot sets stay in memory.
//!     - BackendConfig: NVML or the mock HAL (with injectable failures).
//!     - LoggingConfig: Log level and per-tick data logging.
//!
//! every section and field has a default, so a partial file is valid.
//!
//! ==============================================================================

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::hal::MetricKind;

/// Names an explicit config file, checked before the default locations.
pub const CONFIG_ENV: &str = "GPU_TELEMETRY_CONFIG";

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct HostConfig {
    pub server: ServerConfig,
    pub polling: PollingConfig,
    pub subscribers: SubscribersConfig,
    pub history: HistoryConfig,
    pub backend: BackendConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub assets_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3000,
            assets_dir: PathBuf::from("assets"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_ms: u64,
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        // a zero period would make tokio's interval panic
        Duration::from_millis(self.interval_ms.max(1))
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SubscribersConfig {
    /// Snapshot sets buffered per connection before it counts as lagging.
    pub queue_depth: usize,
}

impl Default for SubscribersConfig {
    fn default() -> Self {
        Self { queue_depth: 16 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HistoryConfig {
    pub capacity: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { capacity: 300 }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Mock,
    Nvml,
}

impl Default for BackendKind {
    fn default() -> Self {
        if cfg!(feature = "nvml") {
            BackendKind::Nvml
        } else {
            BackendKind::Mock
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub mock: MockBackendConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MockBackendConfig {
    pub devices: u32,
    pub failing_metrics: Vec<FailingMetric>,
    pub failing_identity: Vec<u32>,
    /// indices whose `open_device` fails
    pub failing_open: Vec<u32>,
}

impl Default for MockBackendConfig {
    fn default() -> Self {
        Self {
            devices: 2,
            failing_metrics: Vec::new(),
            failing_identity: Vec::new(),
            failing_open: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct FailingMetric {
    pub index: u32,
    pub metric: MetricKind,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_device_data: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            show_device_data: false,
        }
    }
}

impl HostConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        toml::from_str(content).map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))
    }

    /// Load with default fallback
    ///
    /// runs before logging is initialised, so it reports on stdout.
    pub fn load_or_default() -> Self {
        let mut paths = Vec::new();
        if let Ok(explicit) = std::env::var(CONFIG_ENV) {
            paths.push(PathBuf::from(explicit));
        }
        paths.push(PathBuf::from("config").join("host.toml"));
        paths.push(PathBuf::from("..").join("config").join("host.toml"));

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        println!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        println!("[CONFIG] Warning: Failed to load {}: {}", path.display(), e);
                    }
                }
            }
        }

        println!("[CONFIG] Warning: No config file found - using defaults");
        Self::default()
    }

    /// Log configuration summary
    pub fn print_summary(&self) {
        tracing::info!(
            bind = %self.server.bind,
            port = self.server.port,
            interval_ms = self.polling.interval_ms,
            backend = ?self.backend.kind,
            queue_depth = self.subscribers.queue_depth,
            history = self.history.capacity,
            log_level = %self.logging.level,
            "host configuration"
        );
    }
}
