//! Node configuration
//!
//! Loaded from TOML. Cloud credentials are never written in the file itself:
//! the file names the environment variables that hold them and they are
//! resolved when the node starts.

use crate::crypto::KeyKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main node configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    pub device: DeviceSection,
    pub cloud: CloudSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub provisioning: ProvisioningSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    pub store: StoreSection,
    #[serde(default)]
    pub sensors: SensorsSection,
}

/// Device identity section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Hardware-derived unique id, used as the cloud device key
    pub uid: String,
    /// Keep the private key inside a secure element
    #[serde(default)]
    pub secure_element: bool,
}

/// Cloud REST API section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloudSection {
    pub api_url: String,
    /// Organisation (OU) id
    pub org_id: String,
    pub product_key: String,
    /// Environment variable containing the application key
    #[serde(default = "default_access_key_env")]
    pub access_key_env: String,
    /// Environment variable containing the application secret
    #[serde(default = "default_access_secret_env")]
    pub access_secret_env: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_access_key_env() -> String {
    "DECADA_ACCESS_KEY".to_string()
}

fn default_access_secret_env() -> String {
    "DECADA_ACCESS_SECRET".to_string()
}

fn default_request_timeout() -> u64 {
    15
}

/// MQTT broker section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    #[serde(default = "default_broker_host")]
    pub broker_host: String,
    /// Defaults depend on the key backend (18885 software, 18886 secure element)
    pub port: Option<u16>,
    /// Long keep-alive: liveness comes from application publishes, not pings
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// PEM bundle of trusted roots; the compiled-in root is used when absent
    pub root_ca_path: Option<PathBuf>,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker_host: default_broker_host(),
            port: None,
            keep_alive_secs: default_keep_alive(),
            connect_timeout_secs: default_connect_timeout(),
            root_ca_path: None,
        }
    }
}

fn default_broker_host() -> String {
    "mqtt.decada.gov.sg".to_string()
}

fn default_keep_alive() -> u64 {
    3600
}

fn default_connect_timeout() -> u64 {
    30
}

/// Provisioning section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProvisioningSection {
    #[serde(default = "default_creation_retry_delay")]
    pub creation_retry_delay_ms: u64,
    /// Retry device creation forever when absent
    pub max_creation_attempts: Option<u32>,
    /// Retry certificate application forever when absent
    pub max_certificate_attempts: Option<u32>,
    #[serde(default = "default_cert_valid_days")]
    pub cert_valid_days: u32,
    #[serde(default = "default_issue_authority")]
    pub issue_authority: String,
    #[serde(default = "default_subject_base")]
    pub subject_base: String,
}

impl Default for ProvisioningSection {
    fn default() -> Self {
        Self {
            creation_retry_delay_ms: default_creation_retry_delay(),
            max_creation_attempts: None,
            max_certificate_attempts: None,
            cert_valid_days: default_cert_valid_days(),
            issue_authority: default_issue_authority(),
            subject_base: default_subject_base(),
        }
    }
}

fn default_creation_retry_delay() -> u64 {
    500
}

fn default_cert_valid_days() -> u32 {
    365
}

fn default_issue_authority() -> String {
    "ECC".to_string()
}

fn default_subject_base() -> String {
    "C=SG, ST=Singapore, L=Singapore, O=DECADA, OU=DECADA CA".to_string()
}

/// Reconnection supervisor and worker timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisorSection {
    /// Consecutive failed reconnections before a full reset
    #[serde(default = "default_max_failed_reconnections")]
    pub max_failed_reconnections: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_liveness_interval")]
    pub liveness_interval_secs: u64,
    #[serde(default = "default_watchdog_timeout")]
    pub watchdog_timeout_secs: u64,
    /// Attempts to enqueue into a full queue before giving up on the item
    #[serde(default = "default_queue_retry_attempts")]
    pub queue_retry_attempts: u32,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            max_failed_reconnections: default_max_failed_reconnections(),
            retry_delay_ms: default_retry_delay(),
            liveness_interval_secs: default_liveness_interval(),
            watchdog_timeout_secs: default_watchdog_timeout(),
            queue_retry_attempts: default_queue_retry_attempts(),
        }
    }
}

fn default_max_failed_reconnections() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    1000
}

fn default_liveness_interval() -> u64 {
    10
}

fn default_watchdog_timeout() -> u64 {
    60
}

fn default_queue_retry_attempts() -> u32 {
    10
}

/// Persisted state location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreSection {
    pub path: PathBuf,
}

/// Sensor sampling section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorsSection {
    #[serde(default = "default_poll_rate")]
    pub poll_rate_secs: u64,
    /// JSON file of readings maintained by the sensor drivers
    pub readings_path: Option<PathBuf>,
}

impl Default for SensorsSection {
    fn default() -> Self {
        Self {
            poll_rate_secs: default_poll_rate(),
            readings_path: None,
        }
    }
}

fn default_poll_rate() -> u64 {
    60
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
    #[error("Invalid device uid: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl NodeConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_device_uid(&self.device.uid)?;

        url::Url::parse(&self.cloud.api_url).map_err(|e| {
            ConfigError::InvalidConfig(format!("cloud.api_url '{}': {e}", self.cloud.api_url))
        })?;

        for (name, value) in [
            ("cloud.org_id", &self.cloud.org_id),
            ("cloud.product_key", &self.cloud.product_key),
            ("mqtt.broker_host", &self.mqtt.broker_host),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(format!("{name} must not be empty")));
            }
        }

        for (name, value) in [
            (
                "supervisor.max_failed_reconnections",
                u64::from(self.supervisor.max_failed_reconnections),
            ),
            (
                "supervisor.liveness_interval_secs",
                self.supervisor.liveness_interval_secs,
            ),
            (
                "supervisor.watchdog_timeout_secs",
                self.supervisor.watchdog_timeout_secs,
            ),
            (
                "supervisor.queue_retry_attempts",
                u64::from(self.supervisor.queue_retry_attempts),
            ),
            ("mqtt.keep_alive_secs", self.mqtt.keep_alive_secs),
            ("mqtt.connect_timeout_secs", self.mqtt.connect_timeout_secs),
            ("sensors.poll_rate_secs", self.sensors.poll_rate_secs),
            (
                "provisioning.cert_valid_days",
                u64::from(self.provisioning.cert_valid_days),
            ),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        if self.sensors.poll_rate_secs > crate::node::sampling::MAX_POLL_RATE_SECS {
            return Err(ConfigError::InvalidConfig(format!(
                "sensors.poll_rate_secs must not exceed {}",
                crate::node::sampling::MAX_POLL_RATE_SECS
            )));
        }

        if self.mqtt.keep_alive_secs > u64::from(u16::MAX) {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt.keep_alive_secs must not exceed {}",
                u16::MAX
            )));
        }

        for (name, value) in [
            (
                "provisioning.max_creation_attempts",
                self.provisioning.max_creation_attempts,
            ),
            (
                "provisioning.max_certificate_attempts",
                self.provisioning.max_certificate_attempts,
            ),
        ] {
            if value == Some(0) {
                return Err(ConfigError::InvalidConfig(format!(
                    "{name} must be greater than zero when set"
                )));
            }
        }

        crate::crypto::SubjectName::parse_base(&self.provisioning.subject_base)
            .map_err(|e| ConfigError::InvalidConfig(format!("provisioning.subject_base: {e}")))?;

        Ok(())
    }

    fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
        std::env::var(env_var_name)
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ConfigError::EnvVarNotFound(env_var_name.to_string()))
    }

    /// Application key used for token requests
    pub fn get_access_key(&self) -> Result<String, ConfigError> {
        Self::get_env_var_required(&self.cloud.access_key_env)
    }

    /// Application secret used for token and request signatures
    pub fn get_access_secret(&self) -> Result<String, ConfigError> {
        Self::get_env_var_required(&self.cloud.access_secret_env)
    }

    pub fn key_kind(&self) -> KeyKind {
        if self.device.secure_element {
            KeyKind::SecureElement
        } else {
            KeyKind::Software
        }
    }

    /// Broker port, falling back to the port assigned to the key backend
    pub fn broker_port(&self) -> u16 {
        self.mqtt
            .port
            .unwrap_or_else(|| self.key_kind().default_broker_port())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.cloud.request_timeout_secs)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
uid = "abc123"

[cloud]
api_url = "https://ag.decada.gov.sg"
org_id = "o15000000000001"
product_key = "PK1"

[store]
path = "/tmp/decada-node-test.json"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Device uids are hardware serials rendered as alphanumerics
fn validate_device_uid(uid: &str) -> Result<(), ConfigError> {
    if uid.is_empty() || !uid.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(ConfigError::InvalidDeviceId(format!(
            "Device uid '{uid}' must match pattern [a-zA-Z0-9]+"
        )));
    }
    Ok(())
}
