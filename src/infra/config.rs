//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml

use crate::domain::types::GateId;
use anyhow::Context;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Unique facility identifier (e.g. "lot-north")
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "parkgate".to_string()
}

/// Per-gate hardware endpoints: one serial device, one camera, one printer
#[derive(Debug, Clone, Deserialize)]
pub struct GateEndpointConfig {
    pub device: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Camera liveness probe address (host:port), empty disables the probe
    #[serde(default)]
    pub camera_addr: String,
    /// Printer liveness probe address (host:port), empty disables the probe
    #[serde(default)]
    pub printer_addr: String,
}

fn default_baud() -> u32 {
    9600
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatesConfig {
    pub entry: GateEndpointConfig,
    pub exit: GateEndpointConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkConfig {
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
        }
    }
}

fn default_read_timeout_ms() -> u64 {
    250
}

fn default_write_timeout_ms() -> u64 {
    1000
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { ack_timeout_ms: default_ack_timeout_ms() }
    }
}

fn default_ack_timeout_ms() -> u64 {
    3000
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

fn default_probe_interval_secs() -> u64 {
    10
}

fn default_probe_timeout_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsoleConfig {
    #[serde(default = "default_console_enabled")]
    pub enabled: bool,
    #[serde(default = "default_console_port")]
    pub port: u16,
    /// Token granting broadcast privilege to a console; empty disables it
    #[serde(default)]
    pub admin_token: String,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            enabled: default_console_enabled(),
            port: default_console_port(),
            admin_token: String::new(),
        }
    }
}

fn default_console_enabled() -> bool {
    true
}

fn default_console_port() -> u16 {
    9200
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Command/status API port (0 to disable)
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { port: default_http_port() }
    }
}

fn default_http_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct OfflineConfig {
    /// Journal file path (JSONL)
    #[serde(default = "default_offline_journal")]
    pub journal: String,
    /// Central store replay endpoint (host:port); empty disables replay
    #[serde(default)]
    pub store_addr: String,
    #[serde(default = "default_replay_interval_secs")]
    pub replay_interval_secs: u64,
    /// Synced records older than this are eligible for journal compaction
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            journal: default_offline_journal(),
            store_addr: String::new(),
            replay_interval_secs: default_replay_interval_secs(),
            retention_hours: default_retention_hours(),
        }
    }
}

fn default_offline_journal() -> String {
    "offline/queue.jsonl".to_string()
}

fn default_replay_interval_secs() -> u64 {
    30
}

fn default_retention_hours() -> u64 {
    72
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval_secs")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval_secs() }
    }
}

fn default_metrics_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    pub gates: GatesConfig,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub console: ConsoleConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub offline: OfflineConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    entry: GateEndpointConfig,
    exit: GateEndpointConfig,
    link: LinkConfig,
    dispatch: DispatchConfig,
    monitor: MonitorConfig,
    console: ConsoleConfig,
    http: HttpConfig,
    offline: OfflineConfig,
    metrics: MetricsConfig,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: default_site_id(),
            entry: GateEndpointConfig {
                device: "/dev/ttyUSB0".to_string(),
                baud: default_baud(),
                camera_addr: String::new(),
                printer_addr: String::new(),
            },
            exit: GateEndpointConfig {
                device: "/dev/ttyUSB1".to_string(),
                baud: default_baud(),
                camera_addr: String::new(),
                printer_addr: String::new(),
            },
            link: LinkConfig::default(),
            dispatch: DispatchConfig::default(),
            monitor: MonitorConfig::default(),
            console: ConsoleConfig::default(),
            http: HttpConfig::default(),
            offline: OfflineConfig::default(),
            metrics: MetricsConfig::default(),
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Determine the config file path: explicit CLI value first, then the
    /// CONFIG_FILE environment variable, then the default
    pub fn resolve_config_path(cli: Option<&str>) -> String {
        if let Some(path) = cli {
            return path.to_string();
        }
        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }
        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self {
            site_id: toml_config.site.id,
            entry: toml_config.gates.entry,
            exit: toml_config.gates.exit,
            link: toml_config.link,
            dispatch: toml_config.dispatch,
            monitor: toml_config.monitor,
            console: toml_config.console,
            http: toml_config.http,
            offline: toml_config.offline,
            metrics: toml_config.metrics,
            config_file: path.display().to_string(),
        })
    }

    /// Load configuration - tries the TOML file first, falls back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    pub fn endpoint(&self, gate: GateId) -> &GateEndpointConfig {
        match gate {
            GateId::Entry => &self.entry,
            GateId::Exit => &self.exit,
        }
    }

    pub fn link_read_timeout(&self) -> Duration {
        Duration::from_millis(self.link.read_timeout_ms)
    }

    pub fn link_write_timeout(&self) -> Duration {
        Duration::from_millis(self.link.write_timeout_ms)
    }

    pub fn link_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.link.reconnect_delay_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch.ack_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.monitor.probe_timeout_ms)
    }

    pub fn console_enabled(&self) -> bool {
        self.console.enabled
    }

    pub fn console_port(&self) -> u16 {
        self.console.port
    }

    /// Non-empty admin token, if configured
    pub fn console_admin_token(&self) -> Option<&str> {
        if self.console.admin_token.is_empty() {
            None
        } else {
            Some(&self.console.admin_token)
        }
    }

    pub fn http_port(&self) -> u16 {
        self.http.port
    }

    pub fn offline_journal(&self) -> &str {
        &self.offline.journal
    }

    pub fn offline_store_addr(&self) -> Option<&str> {
        if self.offline.store_addr.is_empty() {
            None
        } else {
            Some(&self.offline.store_addr)
        }
    }

    pub fn replay_interval(&self) -> Duration {
        Duration::from_secs(self.offline.replay_interval_secs)
    }

    pub fn offline_retention(&self) -> Duration {
        Duration::from_secs(self.offline.retention_hours * 3600)
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics.interval_secs
    }
}
