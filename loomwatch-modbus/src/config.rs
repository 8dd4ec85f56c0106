//! Configuration for the loom monitor.

use loomwatch_common::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::profile::{DeviceProfile, ProfileTag, RegisterWindow};

/// Most holding registers a single Modbus read may request.
pub const MAX_READ_COUNT: u16 = 125;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete monitor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Field-link settings shared by every machine
    #[serde(default)]
    pub modbus: ModbusConfig,

    /// Central collector settings
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Static machine list; fetched from the collector when empty
    #[serde(default)]
    pub machines: Vec<MachineConfig>,

    /// Liveness listener
    #[serde(default)]
    pub health: HealthConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Modbus link configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusConfig {
    /// TCP port of the controllers (default: 502)
    #[serde(default = "default_modbus_port")]
    pub port: u16,

    /// Unit id override; profile default when absent
    #[serde(default)]
    pub unit_id: Option<u8>,

    /// First register of the read window (1-based); profile default when absent
    #[serde(default)]
    pub start_address: Option<u16>,

    /// Registers per read; profile default when absent
    #[serde(default)]
    pub count: Option<u16>,

    /// Host used for static machines that carry no address
    #[serde(default = "default_host")]
    pub default_host: String,

    /// Connect and read timeout in milliseconds
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Delay between successful polls in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Upper bound of the failure backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_modbus_port() -> u16 {
    502
}

fn default_host() -> String {
    "192.168.205.2".to_string()
}

fn default_read_timeout_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            port: default_modbus_port(),
            unit_id: None,
            start_address: None,
            count: None,
            default_host: default_host(),
            read_timeout_ms: default_read_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl ModbusConfig {
    /// Register window for a profile, with configured overrides applied.
    pub fn window_for(&self, profile: &DeviceProfile) -> RegisterWindow {
        RegisterWindow {
            start: self.start_address.unwrap_or(profile.window.start),
            count: self.count.unwrap_or(profile.window.count),
        }
    }

    /// Unit id for a profile, with the configured override applied.
    pub fn unit_id_for(&self, profile: &DeviceProfile) -> u8 {
        self.unit_id.unwrap_or(profile.unit_id)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Central collector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// API base URL
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Tenant identifier sent with every request
    #[serde(default)]
    pub workspace_id: String,

    /// Static credential sent with every request
    #[serde(default)]
    pub api_key: String,

    /// Publish tick in milliseconds
    #[serde(default = "default_publish_interval_ms")]
    pub publish_interval_ms: u64,

    /// HTTP request timeout in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_base_url() -> String {
    "https://trackweaving.com/api/v1".to_string()
}

fn default_publish_interval_ms() -> u64 {
    4000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            workspace_id: String::new(),
            api_key: String::new(),
            publish_interval_ms: default_publish_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl CollectorConfig {
    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    fn has_credentials(&self) -> bool {
        !self.workspace_id.is_empty() && !self.api_key.is_empty()
    }
}

/// How the loom is wired to the network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "Option<String>")]
pub enum TransportKind {
    /// Controller speaks Modbus TCP directly
    #[default]
    Tcp,
    /// Controller sits behind an RS-485 to TCP gateway
    Rs485,
}

impl From<Option<String>> for TransportKind {
    fn from(value: Option<String>) -> Self {
        match value.map(|v| v.to_lowercase()).as_deref() {
            Some("rs485" | "rs-485" | "rtu") => TransportKind::Rs485,
            _ => TransportKind::Tcp,
        }
    }
}

/// One loom to poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineConfig {
    /// Machine identifier (registry key)
    pub id: String,

    /// Controller or gateway host
    #[serde(default, alias = "ip")]
    pub address: String,

    /// Port override; the link-wide port when absent
    #[serde(default)]
    pub port: Option<u16>,

    /// Register profile
    #[serde(default)]
    pub profile: ProfileTag,

    /// Link kind
    #[serde(default, alias = "deviceType")]
    pub transport: TransportKind,
}

impl MachineConfig {
    /// Host and port to connect to.
    pub fn endpoint(&self, modbus: &ModbusConfig) -> (String, u16) {
        let host = if self.address.is_empty() {
            modbus.default_host.clone()
        } else {
            self.address.clone()
        };
        (host, self.port.unwrap_or(modbus.port))
    }
}

/// Liveness listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Listen address (default: "0.0.0.0:3001")
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "0.0.0.0:3001".to_string()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Launch-time overrides (CLI flags or environment).
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub default_host: Option<String>,
    pub port: Option<u16>,
    pub unit_id: Option<u8>,
    pub start_address: Option<u16>,
    pub count: Option<u16>,
    pub health_port: Option<u16>,
    pub workspace_id: Option<String>,
    pub api_key: Option<String>,
    pub log_level: Option<String>,
}

impl MonitorConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: MonitorConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the optional file, apply `overrides`, then validate the result.
    pub fn load_with_overrides(
        path: Option<&Path>,
        overrides: &Overrides,
    ) -> Result<Self, ConfigError> {
        let mut config: MonitorConfig = match path {
            Some(path) => json5::from_str(&std::fs::read_to_string(path)?)?,
            None => MonitorConfig::default(),
        };
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    /// Apply launch-time overrides on top of the file values.
    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(host) = &overrides.default_host {
            self.modbus.default_host = host.clone();
        }
        if let Some(port) = overrides.port {
            self.modbus.port = port;
        }
        if overrides.unit_id.is_some() {
            self.modbus.unit_id = overrides.unit_id;
        }
        if overrides.start_address.is_some() {
            self.modbus.start_address = overrides.start_address;
        }
        if overrides.count.is_some() {
            self.modbus.count = overrides.count;
        }
        if let Some(port) = overrides.health_port {
            let ip = self
                .health
                .listen
                .parse::<SocketAddr>()
                .map(|addr| addr.ip().to_string())
                .unwrap_or_else(|_| "0.0.0.0".to_string());
            self.health.listen = format!("{}:{}", ip, port);
        }
        if let Some(workspace_id) = &overrides.workspace_id {
            self.collector.workspace_id = workspace_id.clone();
        }
        if let Some(api_key) = &overrides.api_key {
            self.collector.api_key = api_key.clone();
        }
        if let Some(level) = &overrides.log_level {
            self.logging.level = level.clone();
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.modbus.unit_id == Some(0) {
            return Err(ConfigError::Validation("unit_id must be 1-247".to_string()));
        }

        if self.modbus.count == Some(0) {
            return Err(ConfigError::Validation(
                "Register count must be greater than zero".to_string(),
            ));
        }

        if let Some(count) = self.modbus.count.filter(|c| *c > MAX_READ_COUNT) {
            return Err(ConfigError::Validation(format!(
                "Register count {} exceeds the Modbus limit of {} per read",
                count, MAX_READ_COUNT
            )));
        }

        if self.modbus.start_address == Some(0) {
            return Err(ConfigError::Validation(
                "start_address is 1-based and must be at least 1".to_string(),
            ));
        }

        if self.modbus.poll_interval_ms == 0 || self.modbus.read_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "poll_interval_ms and read_timeout_ms must be greater than zero".to_string(),
            ));
        }

        if self.modbus.max_backoff_ms < self.modbus.poll_interval_ms {
            return Err(ConfigError::Validation(
                "max_backoff_ms cannot be lower than poll_interval_ms".to_string(),
            ));
        }

        if self.collector.publish_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "publish_interval_ms must be greater than zero".to_string(),
            ));
        }

        if self.health.listen.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::Validation(format!(
                "Invalid health listen address '{}'",
                self.health.listen
            )));
        }

        if self.machines.is_empty() && !self.collector.has_credentials() {
            return Err(ConfigError::Validation(
                "Either a static machine list or collector credentials must be configured"
                    .to_string(),
            ));
        }

        validate_machines(&self.machines)
    }
}

/// Check a machine list for empty or duplicate ids.
pub fn validate_machines(machines: &[MachineConfig]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for machine in machines {
        if machine.id.is_empty() {
            return Err(ConfigError::Validation(
                "Machine id cannot be empty".to_string(),
            ));
        }
        if !seen.insert(machine.id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Duplicate machine id '{}'",
                machine.id
            )));
        }
    }
    Ok(())
}
