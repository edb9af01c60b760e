//! Pure connection state and CONNECT credential handling
//!
//! Everything in here is deterministic given its inputs, so the broker
//! authentication contract can be tested without a socket.

use crate::cloud::DeviceSecret;
use crate::config::NodeConfig;
use crate::crypto::digest::mqtt_password;
use crate::protocol::TopicError;
use rumqttc::tokio_rustls::rustls::ClientConfig;
use rumqttc::{MqttOptions, TlsConfiguration, Transport};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Connection state of one MQTT session
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// No connection has been attempted yet
    Idle,
    /// CONNECT sent, waiting for ConnAck
    Connecting,
    /// ConnAck received; publishes and subscribes are allowed
    Connected,
    /// Torn down, with the reason
    Disconnected(String),
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Client request failed: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("TLS setup failed: {0}")]
    Tls(String),
    #[error("Invalid topic: {0}")]
    Topic(#[from] TopicError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Broker endpoint and device identity for one session
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub device_id: String,
    pub product_key: String,
    pub device_secret: DeviceSecret,
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &NodeConfig, device_secret: DeviceSecret) -> Self {
        Self {
            device_id: config.device.uid.clone(),
            product_key: config.cloud.product_key.clone(),
            device_secret,
            host: config.mqtt.broker_host.clone(),
            port: config.broker_port(),
            keep_alive: Duration::from_secs(config.mqtt.keep_alive_secs),
            connect_timeout: Duration::from_secs(config.mqtt.connect_timeout_secs),
        }
    }
}

/// CONNECT credentials derived from the device secret
#[derive(Clone, PartialEq, Eq)]
pub struct MqttCredentials {
    pub client_id: String,
    pub username: String,
    password: String,
}

impl fmt::Debug for MqttCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttCredentials")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl MqttCredentials {
    /// Credentials for a CONNECT sent at `timestamp_ms`
    ///
    /// The timestamp appears in both the client id and the hashed password
    /// and must be the same value in each.
    pub fn derive(
        device_id: &str,
        product_key: &str,
        device_secret: &DeviceSecret,
        timestamp_ms: i64,
    ) -> Self {
        let timestamp = timestamp_ms.to_string();
        Self {
            client_id: format!(
                "{device_id}|securemode=2,signmethod=sha256,timestamp={timestamp}|"
            ),
            username: format!("{device_id}&{product_key}"),
            password: mqtt_password(device_id, product_key, &timestamp, device_secret.expose()),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

/// Build the rumqttc options for one connection attempt
pub fn configure_mqtt_options(
    settings: &SessionSettings,
    credentials: &MqttCredentials,
    tls: Arc<ClientConfig>,
) -> MqttOptions {
    let mut options = MqttOptions::new(
        credentials.client_id.clone(),
        settings.host.clone(),
        settings.port,
    );
    options.set_credentials(credentials.username.clone(), credentials.password.clone());
    options.set_keep_alive(settings.keep_alive);
    options.set_clean_session(true);
    options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(tls)));
    options
}
