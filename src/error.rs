//! Top-level error taxonomy for the node
//!
//! Each layer has its own `thiserror` enum. They all fold into [`NodeError`],
//! whose variants mirror the failure classes the node reasons about:
//! transport, auth, protocol, crypto and resource exhaustion.

use crate::cloud::{CloudError, ProvisioningError};
use crate::config::ConfigError;
use crate::crypto::CryptoError;
use crate::queue::QueueError;
use crate::store::StoreError;
use crate::transport::mqtt::MqttError;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

const MAX_MESSAGE_LEN: usize = 500;
const TRUNCATE_SUFFIX: &str = "...[truncated]";

/// Main error type for node operations
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Identity failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Queue '{queue}' still full after {attempts} attempts")]
    FatalResourceExhaustion { queue: &'static str, attempts: u32 },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Persisted state error: {0}")]
    Store(#[from] StoreError),

    #[error("Provisioning failed: {0}")]
    Provisioning(#[source] ProvisioningError),

    #[error("Queue '{0}' closed")]
    ChannelClosed(&'static str),

    #[error("Sensor readings unavailable: {0}")]
    Sensor(String),
}

impl NodeError {
    /// Failure class used as a structured log field
    pub fn category(&self) -> &'static str {
        match self {
            NodeError::Transport(_) => "transport",
            NodeError::Auth(_) => "auth",
            NodeError::Protocol(_) => "protocol",
            NodeError::Crypto(_) => "crypto",
            NodeError::FatalResourceExhaustion { .. } => "fatal_resource_exhaustion",
            NodeError::Config(_) => "config",
            NodeError::Store(_) => "store",
            NodeError::Provisioning(_) => "provisioning",
            NodeError::ChannelClosed(_) => "shutdown",
            NodeError::Sensor(_) => "sensor",
        }
    }
}

impl From<CloudError> for NodeError {
    fn from(error: CloudError) -> Self {
        match error {
            CloudError::Transport(e) => NodeError::Transport(sanitize_error_message(&e.to_string())),
            CloudError::Auth(reason) => NodeError::Auth(reason),
            CloudError::Protocol { endpoint, reason } => {
                NodeError::Protocol(format!("{endpoint}: {reason}"))
            }
            CloudError::Local(reason) => NodeError::Protocol(reason),
        }
    }
}

impl From<ProvisioningError> for NodeError {
    fn from(error: ProvisioningError) -> Self {
        match error {
            ProvisioningError::Cloud(e) => e.into(),
            ProvisioningError::Crypto(e) => NodeError::Crypto(e),
            ProvisioningError::Store(e) => NodeError::Store(e),
            other => NodeError::Provisioning(other),
        }
    }
}

impl From<MqttError> for NodeError {
    fn from(error: MqttError) -> Self {
        match error {
            MqttError::Topic(e) => NodeError::Protocol(e.to_string()),
            MqttError::Serialization(e) => NodeError::Protocol(e.to_string()),
            other => NodeError::Transport(other.to_string()),
        }
    }
}

impl From<QueueError> for NodeError {
    fn from(error: QueueError) -> Self {
        match error {
            QueueError::Exhausted { queue, attempts } => {
                NodeError::FatalResourceExhaustion { queue, attempts }
            }
            QueueError::Closed { queue } => NodeError::ChannelClosed(queue),
        }
    }
}

static SECRET_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)(password|token|key|secret)[=:]\s*\S+").ok());

static JSON_SECRET_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r#"(?i)"(accessToken|deviceSecret|password|encryption)"\s*:\s*"[^"]*""#).ok()
});

static PEM_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"-----BEGIN [A-Z ]*PRIVATE KEY-----[\s\S]*?-----END [A-Z ]*PRIVATE KEY-----").ok()
});

/// Redact credentials from text that may be logged
///
/// Used on HTTP response bodies and transport errors before they reach a log
/// line. Messages longer than 500 bytes are truncated.
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(pattern) = PEM_PATTERN.as_ref() {
        sanitized = pattern
            .replace_all(&sanitized, "***PRIVATE KEY***")
            .to_string();
    }
    if let Some(pattern) = JSON_SECRET_PATTERN.as_ref() {
        sanitized = pattern.replace_all(&sanitized, "\"${1}\":\"***\"").to_string();
    }
    if let Some(pattern) = SECRET_PATTERN.as_ref() {
        sanitized = pattern.replace_all(&sanitized, "${1}=***").to_string();
    }

    if sanitized.len() > MAX_MESSAGE_LEN {
        let mut cut = MAX_MESSAGE_LEN - TRUNCATE_SUFFIX.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{TRUNCATE_SUFFIX}", &sanitized[..cut]);
    }

    sanitized
}

/// Result type for node operations
pub type NodeResult<T> = Result<T, NodeError>;
