//! Device identity: keypair lifecycle and PKCS#10 CSR construction

use super::digest::sha256;
use super::keystore::KeyStore;
use super::CryptoError;
use crate::platform::Clock;
use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair, RemoteKeyPair};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use x509_parser::pem::parse_x509_pem;

/// Ordered distinguished name of a CSR subject
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubjectName {
    attributes: Vec<(String, String)>,
}

impl SubjectName {
    /// Parse a base DN such as `C=SG, ST=Singapore, O=DECADA`
    pub fn parse_base(base: &str) -> Result<Self, CryptoError> {
        let mut attributes = Vec::new();
        for part in base.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                CryptoError::EncodingError(format!("malformed subject component '{part}'"))
            })?;
            let key = key.trim();
            dn_type(key)?;
            attributes.push((key.to_string(), value.trim().to_string()));
        }
        Ok(Self { attributes })
    }

    /// Append the common name `<device-id><timestamp-ms>`
    pub fn with_common_name(mut self, device_id: &str, timestamp_ms: i64) -> Self {
        self.attributes.retain(|(k, _)| k != "CN");
        self.attributes
            .push(("CN".to_string(), format!("{device_id}{timestamp_ms}")));
        self
    }

    pub fn common_name(&self) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == "CN")
            .map(|(_, v)| v.as_str())
    }

    fn to_distinguished_name(&self) -> Result<DistinguishedName, CryptoError> {
        let mut dn = DistinguishedName::new();
        for (key, value) in &self.attributes {
            dn.push(dn_type(key)?, DnValue::Utf8String(value.clone()));
        }
        Ok(dn)
    }
}

impl fmt::Display for SubjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self
            .attributes
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        f.write_str(&rendered.join(", "))
    }
}

fn dn_type(key: &str) -> Result<DnType, CryptoError> {
    match key {
        "C" => Ok(DnType::CountryName),
        "ST" => Ok(DnType::StateOrProvinceName),
        "L" => Ok(DnType::LocalityName),
        "O" => Ok(DnType::OrganizationName),
        "OU" => Ok(DnType::OrganizationalUnitName),
        "CN" => Ok(DnType::CommonName),
        other => Err(CryptoError::EncodingError(format!(
            "unsupported subject attribute '{other}'"
        ))),
    }
}

/// PEM-encoded certificate signing request
#[derive(Debug, Clone)]
pub struct PemCsr {
    pem: String,
    subject: SubjectName,
}

impl PemCsr {
    pub fn as_str(&self) -> &str {
        &self.pem
    }

    pub fn subject(&self) -> &SubjectName {
        &self.subject
    }
}

/// Bridges the key capability into rcgen so CSRs are signed without
/// exporting the private key
struct KeyStoreSigner {
    keys: Arc<dyn KeyStore>,
    public_key: Vec<u8>,
}

impl RemoteKeyPair for KeyStoreSigner {
    fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, rcgen::Error> {
        self.keys
            .sign_prehash(&sha256(msg))
            .map_err(|_| rcgen::Error::RemoteKeyError)
    }

    fn algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        &rcgen::PKCS_ECDSA_P256_SHA256
    }
}

/// The device's cryptographic identity
#[derive(Clone)]
pub struct CryptoIdentity {
    device_id: String,
    subject_base: SubjectName,
    keys: Arc<dyn KeyStore>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for CryptoIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoIdentity")
            .field("device_id", &self.device_id)
            .field("keys", &self.keys)
            .finish()
    }
}

impl CryptoIdentity {
    pub fn new(
        device_id: impl Into<String>,
        subject_base: &str,
        keys: Arc<dyn KeyStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CryptoError> {
        Ok(Self {
            device_id: device_id.into(),
            subject_base: SubjectName::parse_base(subject_base)?,
            keys,
            clock,
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn key_store(&self) -> &Arc<dyn KeyStore> {
        &self.keys
    }

    pub fn has_keypair(&self) -> bool {
        self.keys.has_keypair()
    }

    /// Discard any existing keypair and create a new one
    pub fn generate_keypair(&self) -> Result<(), CryptoError> {
        self.keys.generate_keypair()
    }

    /// Subject for a CSR created at `timestamp_ms`
    pub fn subject_name(&self, timestamp_ms: i64) -> SubjectName {
        self.subject_base
            .clone()
            .with_common_name(&self.device_id, timestamp_ms)
    }

    /// Build a PEM CSR signed by the current keypair, generating one if needed
    pub fn generate_csr(&self) -> Result<PemCsr, CryptoError> {
        if !self.keys.has_keypair() {
            self.keys.generate_keypair()?;
        }

        let subject = self.subject_name(self.clock.now_ms());
        let signer = KeyStoreSigner {
            keys: Arc::clone(&self.keys),
            public_key: self.keys.public_key()?,
        };
        let key_pair = KeyPair::from_remote(Box::new(signer))
            .map_err(|e| CryptoError::KeypairError(e.to_string()))?;

        let mut params = CertificateParams::default();
        params.distinguished_name = subject.to_distinguished_name()?;

        let pem = params
            .serialize_request(&key_pair)
            .and_then(|csr| csr.pem())
            .map_err(|e| CryptoError::EncodingError(e.to_string()))?;

        debug!(subject = %subject, "Generated certificate signing request");
        Ok(PemCsr { pem, subject })
    }

    /// Check that a PEM certificate parses and certifies the current public key
    pub fn verify_certificate(&self, pem: &str) -> Result<(), CryptoError> {
        let (_, block) = parse_x509_pem(pem.as_bytes())
            .map_err(|e| CryptoError::EncodingError(format!("certificate PEM: {e}")))?;
        let certificate = block
            .parse_x509()
            .map_err(|e| CryptoError::EncodingError(format!("certificate DER: {e}")))?;

        let certified: &[u8] = &certificate.public_key().subject_public_key.data;
        if certified != self.keys.public_key()?.as_slice() {
            return Err(CryptoError::CertificateMismatch);
        }
        Ok(())
    }

    /// Sign a pre-hashed digest with the identity's private key
    pub fn sign(&self, digest: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.keys.sign_prehash(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keystore::SoftwareKeyStore;
    use crate::platform::ManualClock;
    use crate::store::MemoryStore;
    use x509_parser::prelude::*;

    const BASE: &str = "C=SG, ST=Singapore, L=Singapore, O=DECADA, OU=DECADA CA";

    fn identity(clock: Arc<ManualClock>) -> CryptoIdentity {
        let keys = Arc::new(SoftwareKeyStore::load(Arc::new(MemoryStore::new())).unwrap());
        CryptoIdentity::new("abc123", BASE, keys, clock).unwrap()
    }

    #[test]
    fn test_subject_name_layout() {
        let id = identity(Arc::new(ManualClock::new(1_600_000_000_000)));
        assert_eq!(
            id.subject_name(1_600_000_000_000).to_string(),
            "C=SG, ST=Singapore, L=Singapore, O=DECADA, OU=DECADA CA, CN=abc1231600000000000"
        );
    }

    #[test]
    fn test_parse_base_rejects_unknown_attribute() {
        assert!(matches!(
            SubjectName::parse_base("C=SG, XX=nope"),
            Err(CryptoError::EncodingError(_))
        ));
        assert!(SubjectName::parse_base("C=SG, broken").is_err());
    }

    #[test]
    fn test_csr_generates_keypair_on_demand() {
        let id = identity(Arc::new(ManualClock::new(1_600_000_000_000)));
        assert!(!id.has_keypair());
        let csr = id.generate_csr().unwrap();
        assert!(id.has_keypair());
        assert!(csr.as_str().starts_with("-----BEGIN CERTIFICATE REQUEST-----"));
    }

    #[test]
    fn test_csr_subjects_differ_one_millisecond_apart() {
        let clock = Arc::new(ManualClock::new(1_600_000_000_000));
        let id = identity(clock.clone());

        let first = id.generate_csr().unwrap();
        clock.advance(1);
        let second = id.generate_csr().unwrap();

        assert_ne!(first.subject().to_string(), second.subject().to_string());
        assert_eq!(first.subject().common_name(), Some("abc1231600000000000"));
        assert_eq!(second.subject().common_name(), Some("abc1231600000000001"));
    }

    /// Certificate for the identity's current key, signed by a throwaway CA
    fn certificate_for(id: &CryptoIdentity) -> String {
        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::new(vec![]).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let csr = id.generate_csr().unwrap();
        rcgen::CertificateSigningRequestParams::from_pem(csr.as_str())
            .unwrap()
            .signed_by(&ca, &ca_key)
            .unwrap()
            .pem()
    }

    #[test]
    fn test_verify_certificate_accepts_matching_key() {
        let id = identity(Arc::new(ManualClock::new(1_600_000_000_000)));
        let pem = certificate_for(&id);
        id.verify_certificate(&pem).unwrap();
    }

    #[test]
    fn test_verify_certificate_rejects_garbage_pem() {
        let id = identity(Arc::new(ManualClock::new(1_600_000_000_000)));
        id.generate_keypair().unwrap();

        for pem in [
            "",
            "not a certificate",
            "-----BEGIN CERTIFICATE-----\nMIIBszCCAVmgAwIBAgIUTEST\n-----END CERTIFICATE-----\n",
        ] {
            assert!(
                matches!(id.verify_certificate(pem), Err(CryptoError::EncodingError(_))),
                "{pem:?} should not parse"
            );
        }
    }

    #[test]
    fn test_verify_certificate_rejects_other_key() {
        let id = identity(Arc::new(ManualClock::new(1_600_000_000_000)));
        let pem = certificate_for(&id);

        id.generate_keypair().unwrap();
        assert!(matches!(
            id.verify_certificate(&pem),
            Err(CryptoError::CertificateMismatch)
        ));
    }

    #[test]
    fn test_csr_parses_back_with_same_common_name() {
        let id = identity(Arc::new(ManualClock::new(1_600_000_000_000)));
        let csr = id.generate_csr().unwrap();

        let (_, pem) = x509_parser::pem::parse_x509_pem(csr.as_str().as_bytes()).unwrap();
        assert_eq!(pem.label, "CERTIFICATE REQUEST");
        let (_, parsed) = X509CertificationRequest::from_der(&pem.contents).unwrap();

        let subject = &parsed.certification_request_info.subject;
        let cn = subject
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap();
        assert_eq!(cn, "abc1231600000000000");
        assert!(cn.starts_with(id.device_id()));

        let org = subject
            .iter_organization()
            .next()
            .and_then(|o| o.as_str().ok())
            .unwrap();
        assert_eq!(org, "DECADA");
    }
}
