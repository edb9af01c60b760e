//! Key capability with a software and a secure-element backend
//!
//! Both backends expose the same three operations: generate a keypair, hand
//! out the public key, and sign a pre-hashed digest. Callers never see
//! private key material, so the TLS handshake and the CSR builder work the
//! same way whether the key lives in memory or inside a secure element.

use super::CryptoError;
use crate::store::{PersistStore, SSL_PRIVATE_KEY};
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rand::rngs::OsRng;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

/// Which backend holds the private key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Software,
    SecureElement,
}

impl KeyKind {
    /// Broker port assigned to devices using this backend
    pub fn default_broker_port(self) -> u16 {
        match self {
            KeyKind::Software => 18885,
            KeyKind::SecureElement => 18886,
        }
    }
}

/// Asymmetric key capability (P-256)
pub trait KeyStore: Send + Sync + fmt::Debug {
    fn kind(&self) -> KeyKind;

    /// Replace any existing keypair with a fresh one
    fn generate_keypair(&self) -> Result<(), CryptoError>;

    fn has_keypair(&self) -> bool;

    /// Uncompressed SEC1 public point of the current keypair
    fn public_key(&self) -> Result<Vec<u8>, CryptoError>;

    /// Sign a SHA-256 digest, returning a DER-encoded ECDSA signature
    fn sign_prehash(&self, digest: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// In-memory P-256 key persisted as PKCS#8 PEM under `ssl_private_key`
pub struct SoftwareKeyStore {
    key: RwLock<Option<SigningKey>>,
    store: Arc<dyn PersistStore>,
}

impl fmt::Debug for SoftwareKeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftwareKeyStore")
            .field("has_keypair", &self.has_keypair())
            .finish()
    }
}

impl SoftwareKeyStore {
    /// Load the persisted key if one exists
    ///
    /// An unreadable key is treated as absent, which forces a new keypair and
    /// a fresh certificate on the next provisioning pass.
    pub fn load(store: Arc<dyn PersistStore>) -> Result<Self, CryptoError> {
        let key = match store.get_non_empty(SSL_PRIVATE_KEY)? {
            Some(pem) => match SigningKey::from_pkcs8_pem(&pem) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!(error = %e, "Persisted private key is unreadable, discarding");
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            key: RwLock::new(key),
            store,
        })
    }
}

impl KeyStore for SoftwareKeyStore {
    fn kind(&self) -> KeyKind {
        KeyKind::Software
    }

    fn generate_keypair(&self) -> Result<(), CryptoError> {
        let key = SigningKey::random(&mut OsRng);
        let pem = key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeypairError(e.to_string()))?;
        self.store.set(SSL_PRIVATE_KEY, &pem)?;

        let mut slot = self
            .key
            .write()
            .map_err(|_| CryptoError::KeypairError("key lock poisoned".to_string()))?;
        *slot = Some(key);
        info!("Generated new software keypair");
        Ok(())
    }

    fn has_keypair(&self) -> bool {
        self.key.read().map(|k| k.is_some()).unwrap_or(false)
    }

    fn public_key(&self) -> Result<Vec<u8>, CryptoError> {
        let slot = self.key.read().map_err(|_| CryptoError::KeyUnavailable)?;
        let key = slot.as_ref().ok_or(CryptoError::KeyUnavailable)?;
        Ok(key
            .verifying_key()
            .to_encoded_point(false)
            .as_bytes()
            .to_vec())
    }

    fn sign_prehash(&self, digest: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let slot = self.key.read().map_err(|_| CryptoError::KeyUnavailable)?;
        let key = slot.as_ref().ok_or(CryptoError::KeyUnavailable)?;
        let signature: Signature = key
            .sign_prehash(digest)
            .map_err(|e| CryptoError::SigningError(e.to_string()))?;
        Ok(signature.to_der().as_bytes().to_vec())
    }
}

/// Hardware secure element holding a P-256 key that never leaves the chip
pub trait SecureElementDriver: Send + Sync {
    /// Generate a key inside the element and return its uncompressed public point
    fn generate_keypair(&self) -> Result<Vec<u8>, CryptoError>;

    /// Public point of the resident key, if one has been generated
    fn public_key(&self) -> Result<Option<Vec<u8>>, CryptoError>;

    /// Sign a digest, returning the raw 64-byte `r || s` form most elements emit
    fn sign_digest(&self, digest: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Key capability delegated to a [`SecureElementDriver`]
pub struct SecureElementKeyStore {
    driver: Box<dyn SecureElementDriver>,
}

impl fmt::Debug for SecureElementKeyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureElementKeyStore").finish_non_exhaustive()
    }
}

impl SecureElementKeyStore {
    pub fn new(driver: Box<dyn SecureElementDriver>) -> Self {
        Self { driver }
    }
}

impl KeyStore for SecureElementKeyStore {
    fn kind(&self) -> KeyKind {
        KeyKind::SecureElement
    }

    fn generate_keypair(&self) -> Result<(), CryptoError> {
        let public_key = self.driver.generate_keypair()?;
        VerifyingKey::from_sec1_bytes(&public_key)
            .map_err(|e| CryptoError::SecureElement(format!("invalid public key: {e}")))?;
        info!("Generated new keypair inside secure element");
        Ok(())
    }

    fn has_keypair(&self) -> bool {
        matches!(self.driver.public_key(), Ok(Some(_)))
    }

    fn public_key(&self) -> Result<Vec<u8>, CryptoError> {
        self.driver.public_key()?.ok_or(CryptoError::KeyUnavailable)
    }

    fn sign_prehash(&self, digest: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let raw = self.driver.sign_digest(digest)?;
        let signature = match raw.len() {
            64 => Signature::from_slice(&raw),
            _ => Signature::from_der(&raw),
        }
        .map_err(|e| CryptoError::SecureElement(format!("malformed signature: {e}")))?;
        Ok(signature.to_der().as_bytes().to_vec())
    }
}
