//! rustls client configuration backed by the device key store
//!
//! The private key is never handed to rustls. Handshake signatures are
//! produced by hashing the transcript with SHA-256 and asking the
//! [`KeyStore`] to sign the digest, which works the same for a software key
//! and for a secure element.

use super::connection::MqttError;
use crate::crypto::digest::sha256;
use crate::crypto::KeyStore;
use rumqttc::tokio_rustls::rustls;
use rustls::client::ResolvesClientCert;
use rustls::pki_types::CertificateDer;
use rustls::sign::{CertifiedKey, Signer, SigningKey};
use rustls::{ClientConfig, RootCertStore, SignatureAlgorithm, SignatureScheme};
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Root CA the broker certificate chains to
pub const DEFAULT_ROOT_CA_PEM: &str = include_str!("comodo_rsa_root.pem");

const SCHEME: SignatureScheme = SignatureScheme::ECDSA_NISTP256_SHA256;

fn parse_certificates(pem: &str, what: &str) -> Result<Vec<CertificateDer<'static>>, MqttError> {
    let mut reader = BufReader::new(pem.as_bytes());
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| MqttError::Tls(format!("unreadable {what}: {e}")))?;
    if certs.is_empty() {
        return Err(MqttError::Tls(format!("no certificate found in {what}")));
    }
    Ok(certs)
}

/// Trust anchors from `path`, or the compiled-in root when none is configured
pub fn root_store(path: Option<&Path>) -> Result<RootCertStore, MqttError> {
    let pem = match path {
        Some(path) => fs::read_to_string(path)
            .map_err(|e| MqttError::Tls(format!("cannot read {}: {e}", path.display())))?,
        None => DEFAULT_ROOT_CA_PEM.to_string(),
    };

    let mut roots = RootCertStore::empty();
    for cert in parse_certificates(&pem, "root CA bundle")? {
        roots
            .add(cert)
            .map_err(|e| MqttError::Tls(format!("rejected root CA: {e}")))?;
    }
    debug!(anchors = roots.len(), "Loaded MQTT trust anchors");
    Ok(roots)
}

#[derive(Debug)]
struct KeyStoreSigner {
    keys: Arc<dyn KeyStore>,
}

impl Signer for KeyStoreSigner {
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, rustls::Error> {
        self.keys
            .sign_prehash(&sha256(message))
            .map_err(|e| rustls::Error::General(format!("key store signing failed: {e}")))
    }

    fn scheme(&self) -> SignatureScheme {
        SCHEME
    }
}

#[derive(Debug)]
struct KeyStoreSigningKey {
    keys: Arc<dyn KeyStore>,
}

impl SigningKey for KeyStoreSigningKey {
    fn choose_scheme(&self, offered: &[SignatureScheme]) -> Option<Box<dyn Signer>> {
        offered.contains(&SCHEME).then(|| {
            Box::new(KeyStoreSigner {
                keys: self.keys.clone(),
            }) as Box<dyn Signer>
        })
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::ECDSA
    }
}

/// Offers the device certificate whenever the server accepts P-256 signatures
#[derive(Debug)]
struct DeviceCertResolver {
    certified: Arc<CertifiedKey>,
}

impl ResolvesClientCert for DeviceCertResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        sigschemes
            .contains(&SCHEME)
            .then(|| self.certified.clone())
    }

    fn has_certs(&self) -> bool {
        true
    }
}

/// Client config presenting `client_cert_pem`, signed through `keys`
pub fn build_client_config(
    roots: RootCertStore,
    client_cert_pem: &str,
    keys: Arc<dyn KeyStore>,
) -> Result<Arc<ClientConfig>, MqttError> {
    if !keys.has_keypair() {
        return Err(MqttError::Tls(
            "no keypair available for client authentication".to_string(),
        ));
    }
    let chain = parse_certificates(client_cert_pem, "client certificate")?;
    let signing_key: Arc<dyn SigningKey> = Arc::new(KeyStoreSigningKey { keys });
    let resolver = DeviceCertResolver {
        certified: Arc::new(CertifiedKey::new(chain, signing_key)),
    };

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_cert_resolver(Arc::new(resolver));
    Ok(Arc::new(config))
}
