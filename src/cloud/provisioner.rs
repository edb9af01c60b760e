//! Device registration and client-certificate exchange
//!
//! Takes a freshly booted node from "unknown to the cloud" to holding a
//! device secret and a signed client certificate. Every step is idempotent:
//! a node that is already registered and holds a certificate performs no
//! certificate traffic at all.

use super::auth::CloudAuthClient;
use super::CloudError;
use crate::config::NodeConfig;
use crate::crypto::{CryptoError, CryptoIdentity};
use crate::platform::Watchdog;
use crate::store::{
    PersistStore, StoreError, CLIENT_CERTIFICATE, CLIENT_CERTIFICATE_SERIAL_NUMBER,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub const DEVICES_PATH: &str = "/connect-service/v2.1/devices";
pub const CERTIFICATES_PATH: &str = "/connect-service/v2.0/certificates";

/// Stored in place of a certificate the node failed to obtain; never a usable value
const INVALID_SENTINEL: &str = "invalid";

/// Provisioning progress, derived from persisted state rather than stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningState {
    /// No usable certificate
    Unprovisioned,
    /// CSR submitted, waiting for a signed certificate
    Provisioning,
    /// Persisted certificate certifies the current keypair
    Provisioned,
}

impl ProvisioningState {
    /// Derive the state at boot from the store and the key backend
    pub fn derive(
        store: &dyn PersistStore,
        identity: &CryptoIdentity,
    ) -> Result<Self, StoreError> {
        if usable_certificate(store, identity)?.is_some() {
            Ok(Self::Provisioned)
        } else {
            Ok(Self::Unprovisioned)
        }
    }
}

impl fmt::Display for ProvisioningState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Unprovisioned => "unprovisioned",
            Self::Provisioning => "provisioning",
            Self::Provisioned => "provisioned",
        };
        f.write_str(text)
    }
}

/// PEM client certificate and the serial number the cloud assigned to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCertificate {
    pub pem: String,
    pub serial: String,
}

/// Per-device MQTT secret issued at registration
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceSecret(String);

impl DeviceSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DeviceSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeviceSecret(***)")
    }
}

/// Retry behaviour of the provisioning loops
#[derive(Debug, Clone)]
pub struct ProvisioningPolicy {
    pub retry_delay: Duration,
    pub max_creation_attempts: Option<u32>,
    pub max_certificate_attempts: Option<u32>,
    pub cert_valid_days: u32,
    pub issue_authority: String,
}

impl ProvisioningPolicy {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            retry_delay: Duration::from_millis(config.provisioning.creation_retry_delay_ms),
            max_creation_attempts: config.provisioning.max_creation_attempts,
            max_certificate_attempts: config.provisioning.max_certificate_attempts,
            cert_valid_days: config.provisioning.cert_valid_days,
            issue_authority: config.provisioning.issue_authority.clone(),
        }
    }
}

/// Provisioning failures that survive the retry loops
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("Cloud request failed: {0}")]
    Cloud(#[from] CloudError),

    #[error("Identity failure: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Persisted state failure: {0}")]
    Store(#[from] StoreError),

    #[error("Gave up after {attempts} attempts to {operation}")]
    AttemptsExhausted {
        operation: &'static str,
        attempts: u32,
    },

    #[error("No persisted certificate serial number to renew")]
    NoCertificateToRenew,
}

#[derive(Serialize)]
struct DeviceName<'a> {
    #[serde(rename = "defaultValue")]
    default_value: String,
    #[serde(rename = "i18nValue")]
    i18n_value: Option<&'a str>,
}

#[derive(Serialize)]
struct CreateDeviceRequest<'a> {
    #[serde(rename = "deviceKey")]
    device_key: &'a str,
    #[serde(rename = "deviceName")]
    device_name: DeviceName<'a>,
    #[serde(rename = "productKey")]
    product_key: &'a str,
    timezone: &'a str,
}

#[derive(Serialize)]
struct ApplyCertificateRequest<'a> {
    csr: &'a str,
    #[serde(rename = "issueAuthority")]
    issue_authority: &'a str,
    #[serde(rename = "validDay")]
    valid_day: u32,
}

#[derive(Serialize)]
struct RenewCertificateRequest {
    #[serde(rename = "certSn")]
    cert_sn: Value,
    #[serde(rename = "validDay")]
    valid_day: u32,
}

/// Read a persisted certificate, ignoring empty or sentinel values
pub fn persisted_certificate(
    store: &dyn PersistStore,
) -> Result<Option<ClientCertificate>, StoreError> {
    let pem = store
        .get_non_empty(CLIENT_CERTIFICATE)?
        .filter(|pem| pem != INVALID_SENTINEL);
    let Some(pem) = pem else {
        return Ok(None);
    };
    let serial = store
        .get(CLIENT_CERTIFICATE_SERIAL_NUMBER)?
        .unwrap_or_default();
    Ok(Some(ClientCertificate { pem, serial }))
}

/// Persisted certificate, kept only when it parses and certifies the current key
pub fn usable_certificate(
    store: &dyn PersistStore,
    identity: &CryptoIdentity,
) -> Result<Option<ClientCertificate>, StoreError> {
    let Some(certificate) = persisted_certificate(store)? else {
        return Ok(None);
    };
    match identity.verify_certificate(&certificate.pem) {
        Ok(()) => Ok(Some(certificate)),
        Err(e) => {
            warn!(error = %e, "Persisted certificate is unusable with the current key");
            Ok(None)
        }
    }
}

/// Extract `data.<field>` as text; numbers are rendered in decimal
fn data_field(value: &Value, endpoint: &str, field: &str) -> Result<String, CloudError> {
    match value.get("data").and_then(|data| data.get(field)) {
        Some(Value::String(s)) if !s.is_empty() && s != INVALID_SENTINEL => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(CloudError::protocol(
            endpoint,
            format!("response has no data.{field}"),
        )),
    }
}

/// Drives registration and certificate issuance for one device
pub struct DeviceProvisioner {
    auth: CloudAuthClient,
    identity: CryptoIdentity,
    store: Arc<dyn PersistStore>,
    watchdog: Arc<dyn Watchdog>,
    policy: ProvisioningPolicy,
    state: Mutex<ProvisioningState>,
}

impl DeviceProvisioner {
    pub fn new(
        auth: CloudAuthClient,
        identity: CryptoIdentity,
        store: Arc<dyn PersistStore>,
        watchdog: Arc<dyn Watchdog>,
        policy: ProvisioningPolicy,
    ) -> Result<Self, ProvisioningError> {
        let state = ProvisioningState::derive(store.as_ref(), &identity)?;
        Ok(Self {
            auth,
            identity,
            store,
            watchdog,
            policy,
            state: Mutex::new(state),
        })
    }

    pub fn state(&self) -> ProvisioningState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ProvisioningState::Unprovisioned)
    }

    fn set_state(&self, next: ProvisioningState) {
        if let Ok(mut state) = self.state.lock() {
            *state = next;
        }
    }

    pub fn identity(&self) -> &CryptoIdentity {
        &self.identity
    }

    fn device_params(&self, action: &str) -> BTreeMap<&'static str, String> {
        let credentials = self.auth.credentials();
        BTreeMap::from([
            ("action", action.to_string()),
            ("deviceKey", self.identity.device_id().to_string()),
            ("orgId", credentials.org_id.clone()),
            ("productKey", credentials.product_key.clone()),
        ])
    }

    /// Look up the device; fails when it is not registered
    pub async fn get_device_secret(&self) -> Result<DeviceSecret, CloudError> {
        let value = self
            .auth
            .signed_get(DEVICES_PATH, self.device_params("get"))
            .await?;
        data_field(&value, DEVICES_PATH, "deviceSecret").map(DeviceSecret)
    }

    /// Register the device under the product
    pub async fn create_device(&self) -> Result<DeviceSecret, CloudError> {
        let credentials = self.auth.credentials();
        let device_id = self.identity.device_id();
        let request = CreateDeviceRequest {
            device_key: device_id,
            device_name: DeviceName {
                default_value: format!("core-{device_id}"),
                i18n_value: None,
            },
            product_key: &credentials.product_key,
            timezone: "+08:00",
        };
        let body = serde_json::to_string(&request)
            .map_err(|e| CloudError::Local(format!("create request encoding: {e}")))?;
        let params = BTreeMap::from([
            ("action", "create".to_string()),
            ("orgId", credentials.org_id.clone()),
        ]);

        let value = self.auth.signed_post(DEVICES_PATH, params, body).await?;
        data_field(&value, DEVICES_PATH, "deviceSecret").map(DeviceSecret)
    }

    /// Return the device secret, registering the device first if needed
    ///
    /// The device is looked up once. After that only creation is retried.
    #[tracing::instrument(name = "check_device_creation", skip(self), fields(device = %self.identity.device_id()))]
    pub async fn check_device_creation(&self) -> Result<DeviceSecret, ProvisioningError> {
        self.watchdog.kick();
        match self.get_device_secret().await {
            Ok(secret) => {
                info!("Device is registered");
                return Ok(secret);
            }
            Err(e) => info!(error = %e, "Device lookup did not return a secret"),
        }

        let mut attempts = 0u32;
        loop {
            self.watchdog.kick();
            attempts += 1;

            match self.create_device().await {
                Ok(secret) => {
                    info!(attempts, "Device created");
                    return Ok(secret);
                }
                Err(e) => warn!(attempt = attempts, error = %e, "Device creation failed"),
            }

            if let Some(max) = self.policy.max_creation_attempts {
                if attempts >= max {
                    return Err(ProvisioningError::AttemptsExhausted {
                        operation: "create device",
                        attempts,
                    });
                }
            }
            tokio::time::sleep(self.policy.retry_delay).await;
        }
    }

    /// Return the persisted certificate, obtaining a new one when it is
    /// absent or does not certify the current key
    #[tracing::instrument(name = "ensure_certificate", skip(self), fields(device = %self.identity.device_id()))]
    pub async fn ensure_certificate(&self) -> Result<ClientCertificate, ProvisioningError> {
        if let Some(certificate) = usable_certificate(self.store.as_ref(), &self.identity)? {
            self.set_state(ProvisioningState::Provisioned);
            return Ok(certificate);
        }

        let mut attempts = 0u32;
        loop {
            self.watchdog.kick();
            attempts += 1;
            self.set_state(ProvisioningState::Provisioning);

            match self.apply_certificate().await {
                Ok(certificate) => {
                    self.persist_certificate(&certificate)?;
                    self.set_state(ProvisioningState::Provisioned);
                    info!(serial = %certificate.serial, "Client certificate issued");
                    return Ok(certificate);
                }
                Err(ProvisioningError::Cloud(e)) => {
                    warn!(attempt = attempts, error = %e, "Certificate application failed");
                }
                Err(e) => return Err(e),
            }

            if let Some(max) = self.policy.max_certificate_attempts {
                if attempts >= max {
                    return Err(ProvisioningError::AttemptsExhausted {
                        operation: "obtain a client certificate",
                        attempts,
                    });
                }
            }
            tokio::time::sleep(self.policy.retry_delay).await;
        }
    }

    /// One certificate application with a fresh keypair
    async fn apply_certificate(&self) -> Result<ClientCertificate, ProvisioningError> {
        // A new keypair voids whatever certificate was stored for the old one
        self.store.remove(CLIENT_CERTIFICATE)?;
        self.store.remove(CLIENT_CERTIFICATE_SERIAL_NUMBER)?;
        self.identity.generate_keypair()?;
        let csr = self.identity.generate_csr()?;

        let request = ApplyCertificateRequest {
            csr: csr.as_str(),
            issue_authority: &self.policy.issue_authority,
            valid_day: self.policy.cert_valid_days,
        };
        let body = serde_json::to_string(&request)
            .map_err(|e| CloudError::Local(format!("apply request encoding: {e}")))?;

        let value = self
            .auth
            .signed_post(CERTIFICATES_PATH, self.device_params("apply"), body)
            .await?;
        let certificate = ClientCertificate {
            pem: data_field(&value, CERTIFICATES_PATH, "cert")?,
            serial: data_field(&value, CERTIFICATES_PATH, "certSN")?,
        };
        self.identity
            .verify_certificate(&certificate.pem)
            .map_err(|e| {
                CloudError::protocol(CERTIFICATES_PATH, format!("issued certificate rejected: {e}"))
            })?;
        Ok(certificate)
    }

    /// Renew the persisted certificate for the same keypair
    ///
    /// The caller must reset the node afterwards so the new certificate is
    /// loaded from scratch.
    #[tracing::instrument(name = "renew_certificate", skip(self), fields(device = %self.identity.device_id()))]
    pub async fn renew_certificate(&self) -> Result<ClientCertificate, ProvisioningError> {
        self.watchdog.kick();
        let serial = self
            .store
            .get_non_empty(CLIENT_CERTIFICATE_SERIAL_NUMBER)?
            .filter(|s| s != INVALID_SENTINEL)
            .ok_or(ProvisioningError::NoCertificateToRenew)?;

        let cert_sn = serial
            .parse::<u64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(serial.clone()));
        let request = RenewCertificateRequest {
            cert_sn,
            valid_day: self.policy.cert_valid_days,
        };
        let body = serde_json::to_string(&request)
            .map_err(|e| CloudError::Local(format!("renew request encoding: {e}")))?;

        let value = self
            .auth
            .signed_post(CERTIFICATES_PATH, self.device_params("renew"), body)
            .await?;
        let certificate = ClientCertificate {
            pem: data_field(&value, CERTIFICATES_PATH, "cert")?,
            serial: data_field(&value, CERTIFICATES_PATH, "certSN")?,
        };

        self.persist_certificate(&certificate)?;
        info!(old_serial = %serial, new_serial = %certificate.serial, "Client certificate renewed");
        Ok(certificate)
    }

    fn persist_certificate(&self, certificate: &ClientCertificate) -> Result<(), StoreError> {
        self.store.set(CLIENT_CERTIFICATE, &certificate.pem)?;
        self.store
            .set(CLIENT_CERTIFICATE_SERIAL_NUMBER, &certificate.serial)
    }
}
