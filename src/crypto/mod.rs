//! Device identity: key capability, CSR construction and wire digests

pub mod digest;
pub mod identity;
pub mod keystore;

pub use identity::{CryptoIdentity, PemCsr, SubjectName};
pub use keystore::{
    KeyKind, KeyStore, SecureElementDriver, SecureElementKeyStore, SoftwareKeyStore,
};

use thiserror::Error;

/// Failures of key generation, CSR encoding and signing
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Keypair generation failed: {0}")]
    KeypairError(String),

    #[error("Encoding failed: {0}")]
    EncodingError(String),

    #[error("Signing failed: {0}")]
    SigningError(String),

    #[error("No keypair available")]
    KeyUnavailable,

    #[error("Certificate does not certify the current public key")]
    CertificateMismatch,

    #[error("Secure element error: {0}")]
    SecureElement(String),

    #[error("Key persistence failed: {0}")]
    Store(#[from] crate::store::StoreError),
}
