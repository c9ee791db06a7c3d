//! PEM helpers shared by the certificate sources

use rustls::pki_types::CertificateDer;
use rustls::sign::CertifiedKey;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use x509_parser::prelude::*;

#[derive(Debug, Error)]
pub enum PemError {
    #[error("Failed to read {0}: {1}")]
    Read(std::path::PathBuf, std::io::Error),

    #[error("No certificate found in PEM data")]
    NoCertificate,

    #[error("No private key found in PEM data")]
    NoPrivateKey,

    #[error("Invalid PEM data: {0}")]
    Invalid(String),

    #[error("Unsupported private key: {0}")]
    UnsupportedKey(String),
}

/// Parse a certificate chain and private key into a rustls signing key.
pub fn certified_key_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<CertifiedKey, PemError> {
    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<_, _>>()
        .map_err(|e| PemError::Invalid(e.to_string()))?;
    if chain.is_empty() {
        return Err(PemError::NoCertificate);
    }

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| PemError::Invalid(e.to_string()))?
        .ok_or(PemError::NoPrivateKey)?;

    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)
        .map_err(|e| PemError::UnsupportedKey(e.to_string()))?;

    Ok(CertifiedKey::new(chain, signing_key))
}

/// Read a cert/key pair from disk into a rustls signing key.
pub fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey, PemError> {
    let cert_pem =
        std::fs::read(cert_path).map_err(|e| PemError::Read(cert_path.to_path_buf(), e))?;
    let key_pem = std::fs::read(key_path).map_err(|e| PemError::Read(key_path.to_path_buf(), e))?;
    certified_key_from_pem(&cert_pem, &key_pem)
}

/// DER bytes of the first certificate in a PEM bundle.
pub fn first_cert_der(pem_data: &[u8]) -> Option<Vec<u8>> {
    Pem::iter_from_buffer(pem_data)
        .flatten()
        .find(|pem| pem.label == "CERTIFICATE")
        .map(|pem| pem.contents)
}

/// Expiry of the first certificate in a PEM bundle.
pub fn cert_not_after(pem_data: &[u8]) -> Option<SystemTime> {
    let der = first_cert_der(pem_data)?;
    let (_, cert) = X509Certificate::from_der(&der).ok()?;
    let timestamp = cert.validity().not_after.timestamp();
    UNIX_EPOCH.checked_add(Duration::from_secs(u64::try_from(timestamp).ok()?))
}

/// Whether the first certificate in a PEM bundle stays valid for at least `margin`.
pub fn valid_for(pem_data: &[u8], margin: Duration) -> bool {
    cert_not_after(pem_data).is_some_and(|exp| SystemTime::now() + margin < exp)
}
