//! Local development certificate authority
//!
//! The root CA lives on disk as `rootCA.pem` / `rootCA-key.pem` under the
//! per-user CA directory and is generated once. Leaf certificates for the dev
//! certificate source are signed by it and written to a fixed location.

use crate::defaults::{CA_VALIDITY_DAYS, DEV_LEAF_VALIDITY};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyIdMethod, KeyPair, KeyUsagePurpose, SanType,
};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use time::{Duration, OffsetDateTime};

pub const ROOT_CERT_FILENAME: &str = "rootCA.pem";
pub const ROOT_KEY_FILENAME: &str = "rootCA-key.pem";
pub const LEAF_CERT_FILENAME: &str = "cert.pem";
pub const LEAF_KEY_FILENAME: &str = "key.pem";

const CA_ORGANIZATION: &str = "Warden development CA";

#[derive(Debug, Error)]
pub enum CaError {
    #[error("Failed to generate keypair: {0}")]
    KeypairGeneration(String),

    #[error("Failed to generate certificate: {0}")]
    CertificateGeneration(String),

    #[error("Failed to parse certificate/key: {0}")]
    Parse(String),

    #[error("Failed to read file {0}: {1}")]
    FileRead(PathBuf, std::io::Error),

    #[error("Failed to write file {0}: {1}")]
    FileWrite(PathBuf, std::io::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, CaError>;

/// The development root CA, as persisted.
#[derive(Clone)]
pub struct RootCa {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl std::fmt::Debug for RootCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootCa")
            .field("cert_path", &self.cert_path)
            .field("key_path", &self.key_path)
            .finish_non_exhaustive()
    }
}

impl RootCa {
    /// DER encoding of the root certificate.
    pub fn cert_der(&self) -> Result<Vec<u8>> {
        super::pem::first_cert_der(self.cert_pem.as_bytes())
            .ok_or_else(|| CaError::Parse("root CA PEM has no certificate".to_string()))
    }
}

/// Paths of an issued leaf certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafPaths {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl LeafPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            cert_path: dir.join(LEAF_CERT_FILENAME),
            key_path: dir.join(LEAF_KEY_FILENAME),
        }
    }

    pub fn exists(&self) -> bool {
        self.cert_path.exists() && self.key_path.exists()
    }
}

/// Load the root CA from `ca_dir`, generating and persisting it on first use.
pub fn ensure_root_ca(ca_dir: &Path, host_identity: &str) -> Result<RootCa> {
    let cert_path = ca_dir.join(ROOT_CERT_FILENAME);
    let key_path = ca_dir.join(ROOT_KEY_FILENAME);

    match (cert_path.exists(), key_path.exists()) {
        (true, true) => {
            let cert_pem = fs::read_to_string(&cert_path)
                .map_err(|e| CaError::FileRead(cert_path.clone(), e))?;
            let key_pem = fs::read_to_string(&key_path)
                .map_err(|e| CaError::FileRead(key_path.clone(), e))?;
            KeyPair::from_pem(&key_pem)
                .map_err(|e| CaError::Parse(format!("root CA key: {}", e)))?;
            if super::pem::first_cert_der(cert_pem.as_bytes()).is_none() {
                return Err(CaError::Parse(format!(
                    "{} does not contain a certificate",
                    cert_path.display()
                )));
            }
            tracing::debug!(path = %cert_path.display(), "Loaded development root CA");
            return Ok(RootCa {
                cert_pem,
                key_pem,
                cert_path,
                key_path,
            });
        }
        (true, false) => {
            // Regenerating would silently orphan a CA that may already be trusted.
            return Err(CaError::Validation(format!(
                "found {} but its key {} is missing",
                cert_path.display(),
                key_path.display()
            )));
        }
        _ => {}
    }

    let (cert_pem, key_pem) = generate_root(host_identity)?;

    fs::create_dir_all(ca_dir).map_err(|e| CaError::FileWrite(ca_dir.to_path_buf(), e))?;
    write_file(&cert_path, cert_pem.as_bytes(), 0o644)?;
    write_file(&key_path, key_pem.as_bytes(), 0o600)?;

    tracing::info!(
        path = %cert_path.display(),
        host_identity,
        "Created development root CA"
    );

    Ok(RootCa {
        cert_pem,
        key_pem,
        cert_path,
        key_path,
    })
}

fn generate_root(host_identity: &str) -> Result<(String, String)> {
    let key_pair = KeyPair::generate().map_err(|e| CaError::KeypairGeneration(e.to_string()))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        format!("{} {}", CA_ORGANIZATION, host_identity),
    );
    dn.push(DnType::OrganizationName, CA_ORGANIZATION);
    dn.push(DnType::OrganizationalUnitName, host_identity);
    params.distinguished_name = dn;

    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.key_identifier_method = KeyIdMethod::PreSpecified(subject_key_id(&key_pair));

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CaError::CertificateGeneration(e.to_string()))?;

    Ok((cert.pem(), key_pair.serialize_pem()))
}

/// SHA-256 of the public key, truncated to the customary 20 bytes.
fn subject_key_id(key_pair: &KeyPair) -> Vec<u8> {
    Sha256::digest(key_pair.public_key_raw())[..20].to_vec()
}

/// Issue a leaf for `names` signed by `root` and write it into `out_dir`.
///
/// Names that parse as IP addresses become IP SANs. The first name is the
/// subject CN.
pub fn issue_leaf(root: &RootCa, names: &[String], out_dir: &Path) -> Result<LeafPaths> {
    let primary = names
        .first()
        .ok_or_else(|| CaError::Validation("At least one name is required".to_string()))?;

    let ca_key = KeyPair::from_pem(&root.key_pem)
        .map_err(|e| CaError::Parse(format!("Failed to parse CA private key: {}", e)))?;
    let issuer = Issuer::from_ca_cert_pem(&root.cert_pem, ca_key)
        .map_err(|e| CaError::Parse(format!("Failed to parse CA certificate: {}", e)))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, primary.as_str());
    dn.push(DnType::OrganizationName, CA_ORGANIZATION);
    params.distinguished_name = dn;

    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.use_authority_key_identifier_extension = true;

    let mut sans = Vec::with_capacity(names.len());
    for name in names {
        if let Ok(ip) = name.parse::<std::net::IpAddr>() {
            sans.push(SanType::IpAddress(ip));
        } else {
            let dns = name.as_str().try_into().map_err(|e| {
                CaError::Validation(format!("Invalid DNS name '{}': {:?}", name, e))
            })?;
            sans.push(SanType::DnsName(dns));
        }
    }
    params.subject_alt_names = sans;

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::seconds(DEV_LEAF_VALIDITY.as_secs() as i64);

    let leaf_key = KeyPair::generate().map_err(|e| CaError::KeypairGeneration(e.to_string()))?;
    let leaf = params.signed_by(&leaf_key, &issuer).map_err(|e| {
        CaError::CertificateGeneration(format!("Failed to sign leaf certificate: {}", e))
    })?;

    let paths = LeafPaths::in_dir(out_dir);
    fs::create_dir_all(out_dir).map_err(|e| CaError::FileWrite(out_dir.to_path_buf(), e))?;
    write_file(&paths.cert_path, leaf.pem().as_bytes(), 0o644)?;
    write_file(&paths.key_path, leaf_key.serialize_pem().as_bytes(), 0o600)?;

    tracing::info!(
        names = ?names,
        path = %paths.cert_path.display(),
        "Issued development certificate"
    );

    Ok(paths)
}

fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    fs::write(path, contents).map_err(|e| CaError::FileWrite(path.to_path_buf(), e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|e| CaError::FileWrite(path.to_path_buf(), e))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use x509_parser::extensions::{GeneralName, ParsedExtension};
    use x509_parser::prelude::*;

    fn parse(pem: &str) -> Vec<u8> {
        super::super::pem::first_cert_der(pem.as_bytes()).unwrap()
    }

    #[test]
    fn root_ca_is_created_once() {
        let temp = TempDir::new().unwrap();
        let first = ensure_root_ca(temp.path(), "me@box").unwrap();
        let second = ensure_root_ca(temp.path(), "someone-else@box").unwrap();
        assert_eq!(first.cert_pem, second.cert_pem);
        assert_eq!(first.key_pem, second.key_pem);
        assert!(temp.path().join(ROOT_CERT_FILENAME).exists());
        assert!(temp.path().join(ROOT_KEY_FILENAME).exists());
    }

    #[cfg(unix)]
    #[test]
    fn root_key_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let temp = TempDir::new().unwrap();
        let root = ensure_root_ca(temp.path(), "me@box").unwrap();
        let mode = fs::metadata(&root.key_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn root_ca_carries_identity_and_ca_constraints() {
        let temp = TempDir::new().unwrap();
        let root = ensure_root_ca(temp.path(), "me@box").unwrap();
        let der = parse(&root.cert_pem);
        let (_, cert) = X509Certificate::from_der(&der).unwrap();

        let cn = cert.subject().iter_common_name().next().unwrap();
        assert!(cn.as_str().unwrap().contains("me@box"));
        let ou = cert.subject().iter_organizational_unit().next().unwrap();
        assert_eq!(ou.as_str().unwrap(), "me@box");

        assert!(cert.is_ca());
        let ski = cert
            .extensions()
            .iter()
            .find_map(|ext| match ext.parsed_extension() {
                ParsedExtension::SubjectKeyIdentifier(id) => Some(id.0.to_vec()),
                _ => None,
            })
            .expect("subject key identifier");
        assert_eq!(ski.len(), 20);

        let lifetime = cert.validity().not_after.timestamp() - cert.validity().not_before.timestamp();
        assert_eq!(lifetime, CA_VALIDITY_DAYS * 86400);
    }

    #[test]
    fn orphaned_root_cert_is_an_error() {
        let temp = TempDir::new().unwrap();
        let root = ensure_root_ca(temp.path(), "me@box").unwrap();
        fs::remove_file(&root.key_path).unwrap();
        assert!(matches!(
            ensure_root_ca(temp.path(), "me@box"),
            Err(CaError::Validation(_))
        ));
    }

    #[test]
    fn leaf_covers_requested_names() {
        let temp = TempDir::new().unwrap();
        let root = ensure_root_ca(&temp.path().join("ca"), "me@box").unwrap();
        let names = vec![
            "*.example.test".to_string(),
            "example.test".to_string(),
            "localhost".to_string(),
            "127.0.0.1".to_string(),
            "::1".to_string(),
        ];
        let paths = issue_leaf(&root, &names, &temp.path().join("dev")).unwrap();
        assert!(paths.exists());

        let pem = fs::read_to_string(&paths.cert_path).unwrap();
        let der = parse(&pem);
        let (_, cert) = X509Certificate::from_der(&der).unwrap();

        assert!(!cert.is_ca());
        let root_der = parse(&root.cert_pem);
        let (_, root_cert) = X509Certificate::from_der(&root_der).unwrap();
        assert_eq!(cert.issuer().to_string(), root_cert.subject().to_string());

        let mut dns = Vec::new();
        let mut ips = 0;
        for ext in cert.extensions() {
            if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
                for name in &san.general_names {
                    match name {
                        GeneralName::DNSName(d) => dns.push(d.to_string()),
                        GeneralName::IPAddress(_) => ips += 1,
                        _ => {}
                    }
                }
            }
        }
        assert_eq!(dns, vec!["*.example.test", "example.test", "localhost"]);
        assert_eq!(ips, 2);

        let lifetime = cert.validity().not_after.timestamp() - cert.validity().not_before.timestamp();
        assert_eq!(lifetime, DEV_LEAF_VALIDITY.as_secs() as i64);
    }

    #[test]
    fn leaf_requires_a_name() {
        let temp = TempDir::new().unwrap();
        let root = ensure_root_ca(temp.path(), "me@box").unwrap();
        assert!(matches!(
            issue_leaf(&root, &[], temp.path()),
            Err(CaError::Validation(_))
        ));
    }

    #[test]
    fn leaf_loads_as_rustls_key() {
        let temp = TempDir::new().unwrap();
        let root = ensure_root_ca(&temp.path().join("ca"), "me@box").unwrap();
        let paths = issue_leaf(&root, &["localhost".to_string()], &temp.path().join("dev")).unwrap();
        super::super::pem::load_certified_key(&paths.cert_path, &paths.key_path).unwrap();
    }
}
