//! DECADA REST API: token issuance, device registration and certificate exchange

pub mod auth;
pub mod provisioner;

pub use auth::{AccessToken, CloudAuthClient, CloudCredentials};
pub use provisioner::{
    ClientCertificate, DeviceProvisioner, DeviceSecret, ProvisioningError, ProvisioningPolicy,
    ProvisioningState,
};

use thiserror::Error;

/// Failures talking to the cloud API
///
/// Every variant means "not provisioned yet, retry" to the provisioning
/// layer; none of them should abort the node on their own.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("HTTP transport failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Authentication rejected: {0}")]
    Auth(String),

    #[error("Unexpected response from {endpoint}: {reason}")]
    Protocol { endpoint: String, reason: String },

    #[error("Local failure: {0}")]
    Local(String),
}

impl CloudError {
    pub(crate) fn protocol(endpoint: &str, reason: impl Into<String>) -> Self {
        Self::Protocol {
            endpoint: endpoint.to_string(),
            reason: reason.into(),
        }
    }
}
