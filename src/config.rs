//! Device configuration loaded from TOML
//!
//! Broker endpoint, certificate paths, retry policy, command dispatch and
//! telemetry settings. Secrets (SAS tokens) are never stored in the file; the
//! file names the environment variable that holds them.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default IoT hub MQTT API version embedded in the broker username
pub const DEFAULT_API_VERSION: &str = "2019-03-30";

/// Main device configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub device: DeviceSection,
    pub broker: BrokerSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub commands: CommandsSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
}

/// Device section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Device identifier registered with the hub (must match [a-zA-Z0-9._-]+)
    pub id: String,
}

/// Broker endpoint and credentials
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Hub hostname, e.g. `my-hub.azure-devices.net`
    pub hostname: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// PEM file with the CA certificate used to verify the broker
    pub ca_cert: Option<PathBuf>,
    /// PEM file with the device certificate (mutual TLS)
    pub device_cert: Option<PathBuf>,
    /// PEM file with the device private key (mutual TLS)
    pub device_key: Option<PathBuf>,
    /// Environment variable containing a SAS token used as MQTT password
    pub sas_token_env: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// How long a single connection attempt waits for the broker's ConnAck
    #[serde(default = "default_connack_timeout")]
    pub connack_timeout_secs: u64,
    /// Also subscribe to `devices/{id}/messages/devicebound/#`
    #[serde(default = "default_true")]
    pub subscribe_cloud_to_device: bool,
}

/// Connection retry policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    /// Retries after the first failed attempt of a connect cycle
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// What to do with an invocation of a method nobody registered
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UnknownCommandPolicy {
    /// Reply with status 404 and an error message
    #[default]
    ReplyNotFound,
    /// Drop the invocation without replying
    Drop,
}

/// Command dispatch settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandsSection {
    /// Upper bound on a single handler execution
    #[serde(default = "default_command_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub unknown_command: UnknownCommandPolicy,
    /// Invocations allowed to run at the same time
    #[serde(default = "default_max_concurrent_commands")]
    pub max_concurrent: usize,
}

impl Default for CommandsSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_command_timeout_ms(),
            unknown_command: UnknownCommandPolicy::default(),
            max_concurrent: default_max_concurrent_commands(),
        }
    }
}

/// Periodic telemetry settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_telemetry_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_schema")]
    pub schema: String,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_telemetry_interval(),
            schema: default_schema(),
        }
    }
}

fn default_broker_port() -> u16 {
    8883
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_connack_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    8000
}

fn default_command_timeout_ms() -> u64 {
    30_000
}

fn default_max_concurrent_commands() -> usize {
    16
}

fn default_telemetry_interval() -> u64 {
    5
}

fn default_schema() -> String {
    "test_schema".to_string()
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid device ID format: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Immutable identity of this device towards the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub broker_hostname: String,
    pub broker_port: u16,
    api_version: String,
}

impl DeviceIdentity {
    pub fn new(
        device_id: impl Into<String>,
        broker_hostname: impl Into<String>,
        broker_port: u16,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            broker_hostname: broker_hostname.into(),
            broker_port,
            api_version: DEFAULT_API_VERSION.to_string(),
        }
    }

    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }

    /// Broker username: `{hostname}/{deviceId}/api-version={version}`
    pub fn username(&self) -> String {
        format!(
            "{}/{}/api-version={}",
            self.broker_hostname, self.device_id, self.api_version
        )
    }
}

impl DeviceConfig {
    /// Load configuration from TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: DeviceConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_device_id(&self.device.id)?;

        if self.broker.hostname.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker.hostname must not be empty".to_string(),
            ));
        }
        if self.broker.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker.port must be greater than 0".to_string(),
            ));
        }
        if self.broker.device_cert.is_some() != self.broker.device_key.is_some() {
            return Err(ConfigError::InvalidConfig(
                "broker.device_cert and broker.device_key must be set together".to_string(),
            ));
        }
        if self.broker.device_cert.is_some() && self.broker.ca_cert.is_none() {
            return Err(ConfigError::InvalidConfig(
                "client certificate authentication requires broker.ca_cert".to_string(),
            ));
        }
        if self.broker.connack_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker.connack_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err(ConfigError::InvalidConfig(
                "reconnect.initial_delay_ms must not exceed reconnect.max_delay_ms".to_string(),
            ));
        }
        if self.commands.timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "commands.timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.commands.max_concurrent == 0 {
            return Err(ConfigError::InvalidConfig(
                "commands.max_concurrent must be greater than 0".to_string(),
            ));
        }
        if self.telemetry.enabled && self.telemetry.interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "telemetry.interval_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Identity derived from the device and broker sections
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(&self.device.id, &self.broker.hostname, self.broker.port)
            .with_api_version(&self.broker.api_version)
    }

    /// Get the SAS token from its environment variable, if one is configured
    pub fn get_sas_token(&self) -> Result<Option<String>, ConfigError> {
        match &self.broker.sas_token_env {
            Some(name) => std::env::var(name)
                .map(Some)
                .map_err(|_| ConfigError::EnvVarNotFound(name.clone())),
            None => Ok(None),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.commands.timeout_ms)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry.interval_secs)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
id = "test-device"

[broker]
hostname = "test-hub.azure-devices.net"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Validate device ID format; the id is embedded in topics so MQTT
/// separators and wildcards are not allowed
fn validate_device_id(device_id: &str) -> Result<(), ConfigError> {
    let valid_chars = device_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if device_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidDeviceId(format!(
            "Device ID '{device_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}
