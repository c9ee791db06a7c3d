//! Development certificate source
//!
//! On first use: load or create the root CA, make sure the OS trusts it, then
//! issue (or reuse) the leaf for the configured names. The resulting key is
//! memoized and replaced once it gets close to expiry.

use super::ca::{self, CaError, LeafPaths, RootCa};
use super::pem::{self, PemError};
use super::trust::{TrustError, TrustInstaller};
use crate::defaults::DEV_LEAF_RENEW_MARGIN;
use parking_lot::RwLock;
use rustls::sign::CertifiedKey;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use warden_core::DomainSpec;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::*;

/// Names every dev leaf covers in addition to the configured domain.
const LOOPBACK_NAMES: [&str; 3] = ["localhost", "127.0.0.1", "::1"];

#[derive(Debug, Error)]
pub enum DevError {
    #[error(transparent)]
    Ca(#[from] CaError),

    #[error("Failed to install root CA: {0}")]
    Trust(#[from] TrustError),

    #[error("Failed to load development certificate: {0}")]
    Pem(#[from] PemError),

    #[error("Certificate generation task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone)]
pub struct DevSourceConfig {
    pub ca_dir: PathBuf,
    /// Fixed directory for the active leaf (`cert.pem`, `key.pem`).
    pub leaf_dir: PathBuf,
    pub host_identity: String,
    pub names: Vec<String>,
    pub install_trust: bool,
}

/// SANs for a dev leaf: the domain names followed by loopback names.
pub fn dev_certificate_names(domain: &DomainSpec) -> Vec<String> {
    let mut names = domain.certificate_names();
    for name in LOOPBACK_NAMES {
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

#[derive(Clone)]
struct ActiveLeaf {
    key: Arc<CertifiedKey>,
    not_after: SystemTime,
}

impl ActiveLeaf {
    fn is_fresh(&self) -> bool {
        SystemTime::now() + DEV_LEAF_RENEW_MARGIN < self.not_after
    }
}

pub struct DevSource {
    config: DevSourceConfig,
    installer: Arc<TrustInstaller>,
    root: OnceCell<RootCa>,
    active: RwLock<Option<ActiveLeaf>>,
    issue_gate: Mutex<()>,
}

impl DevSource {
    pub fn new(config: DevSourceConfig, installer: Arc<TrustInstaller>) -> Self {
        Self {
            config,
            installer,
            root: OnceCell::new(),
            active: RwLock::new(None),
            issue_gate: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &DevSourceConfig {
        &self.config
    }

    /// The root CA, created and trusted at most once per process.
    pub async fn root(&self) -> Result<&RootCa, DevError> {
        self.root
            .get_or_try_init(|| async {
                let config = self.config.clone();
                let installer = self.installer.clone();
                tokio::task::spawn_blocking(move || -> Result<RootCa, DevError> {
                    let root = ca::ensure_root_ca(&config.ca_dir, &config.host_identity)?;
                    if config.install_trust {
                        installer.ensure_installed(&root)?;
                    } else {
                        tracing::info!("Skipping root CA trust installation");
                    }
                    Ok(root)
                })
                .await
                .map_err(|e| DevError::Task(e.to_string()))?
            })
            .await
    }

    /// The current leaf, issuing a new one when none is cached or it expired.
    pub async fn certified_key(&self) -> Result<Arc<CertifiedKey>, DevError> {
        if let Some(key) = self.fresh_key() {
            return Ok(key);
        }

        let _gate = self.issue_gate.lock().await;
        if let Some(key) = self.fresh_key() {
            return Ok(key);
        }

        let root = self.root().await?.clone();
        let config = self.config.clone();
        let leaf = tokio::task::spawn_blocking(move || load_or_issue(&root, &config))
            .await
            .map_err(|e| DevError::Task(e.to_string()))??;

        let key = leaf.key.clone();
        *self.active.write() = Some(leaf);
        Ok(key)
    }

    fn fresh_key(&self) -> Option<Arc<CertifiedKey>> {
        self.active
            .read()
            .as_ref()
            .filter(|leaf| leaf.is_fresh())
            .map(|leaf| leaf.key.clone())
    }
}

fn load_or_issue(root: &RootCa, config: &DevSourceConfig) -> Result<ActiveLeaf, DevError> {
    let paths = LeafPaths::in_dir(&config.leaf_dir);

    if paths.exists()
        && let Ok(cert_pem) = std::fs::read(&paths.cert_path)
        && pem::valid_for(&cert_pem, DEV_LEAF_RENEW_MARGIN)
        && leaf_matches(&cert_pem, root, &config.names)
    {
        match load_active(&paths) {
            Ok(leaf) => {
                tracing::debug!(path = %paths.cert_path.display(), "Reusing development certificate");
                return Ok(leaf);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Existing development certificate is unusable, reissuing");
            }
        }
    }

    let paths = ca::issue_leaf(root, &config.names, &config.leaf_dir)?;
    load_active(&paths)
}

fn load_active(paths: &LeafPaths) -> Result<ActiveLeaf, DevError> {
    let key = pem::load_certified_key(&paths.cert_path, &paths.key_path)?;
    let cert_pem = std::fs::read(&paths.cert_path)
        .map_err(|e| PemError::Read(paths.cert_path.clone(), e))?;
    let not_after = pem::cert_not_after(&cert_pem)
        .ok_or_else(|| PemError::Invalid("certificate has no usable expiry".to_string()))?;
    Ok(ActiveLeaf {
        key: Arc::new(key),
        not_after,
    })
}

/// Whether a leaf on disk was issued by `root` for exactly `names`.
fn leaf_matches(cert_pem: &[u8], root: &RootCa, names: &[String]) -> bool {
    let (Some(leaf_der), Some(root_der)) = (
        pem::first_cert_der(cert_pem),
        pem::first_cert_der(root.cert_pem.as_bytes()),
    ) else {
        return false;
    };
    let (Ok((_, leaf)), Ok((_, root_cert))) = (
        X509Certificate::from_der(&leaf_der),
        X509Certificate::from_der(&root_der),
    ) else {
        return false;
    };

    if leaf.issuer().as_raw() != root_cert.subject().as_raw() {
        return false;
    }

    let mut sans = Vec::new();
    for ext in leaf.extensions() {
        if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
            for name in &san.general_names {
                match name {
                    GeneralName::DNSName(d) => sans.push(d.to_string()),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_bytes(bytes) {
                            sans.push(ip.to_string());
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    let mut wanted: Vec<String> = names
        .iter()
        .map(|n| match n.parse::<std::net::IpAddr>() {
            Ok(ip) => ip.to_string(),
            Err(_) => n.clone(),
        })
        .collect();
    wanted.sort();
    sans.sort();
    wanted == sans
}

fn ip_from_bytes(bytes: &[u8]) -> Option<std::net::IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(std::net::IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(std::net::IpAddr::from),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::trust::{CommandOutput, CommandRunner, SystemTrust};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingRunner {
        calls: AtomicUsize,
    }

    impl CommandRunner for CountingRunner {
        fn run(&self, _program: &str, _args: &[String]) -> std::io::Result<CommandOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(CommandOutput {
                success: true,
                ..Default::default()
            })
        }
    }

    fn config(temp: &TempDir, names: &[&str]) -> DevSourceConfig {
        DevSourceConfig {
            ca_dir: temp.path().join("ca"),
            leaf_dir: temp.path().join("dev"),
            host_identity: "me@box".to_string(),
            names: names.iter().map(|n| n.to_string()).collect(),
            install_trust: false,
        }
    }

    fn untrusted() -> Arc<TrustInstaller> {
        Arc::new(TrustInstaller::new(
            SystemTrust::Unsupported,
            Arc::new(CountingRunner::default()),
            false,
            Vec::new(),
        ))
    }

    fn cert_der(key: &CertifiedKey) -> Vec<u8> {
        key.cert[0].as_ref().to_vec()
    }

    #[test]
    fn names_cover_domain_and_loopback() {
        let spec = DomainSpec::parse("*.example.test").unwrap();
        assert_eq!(
            dev_certificate_names(&spec),
            vec!["*.example.test", "example.test", "localhost", "127.0.0.1", "::1"]
        );

        let spec = DomainSpec::parse("localhost").unwrap();
        assert_eq!(
            dev_certificate_names(&spec),
            vec!["localhost", "127.0.0.1", "::1"]
        );
    }

    #[tokio::test]
    async fn key_is_memoized() {
        let temp = TempDir::new().unwrap();
        let source = DevSource::new(config(&temp, &["localhost"]), untrusted());

        let first = source.certified_key().await.unwrap();
        let second = source.certified_key().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_issuance() {
        let temp = TempDir::new().unwrap();
        let source = Arc::new(DevSource::new(config(&temp, &["localhost"]), untrusted()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let source = source.clone();
                tokio::spawn(async move { source.certified_key().await.unwrap() })
            })
            .collect();

        let mut keys = Vec::new();
        for handle in handles {
            keys.push(handle.await.unwrap());
        }
        assert!(keys.iter().all(|k| Arc::ptr_eq(k, &keys[0])));
    }

    #[tokio::test]
    async fn leaf_on_disk_is_reused_across_restarts() {
        let temp = TempDir::new().unwrap();
        let first = DevSource::new(config(&temp, &["localhost", "127.0.0.1"]), untrusted())
            .certified_key()
            .await
            .unwrap();
        let second = DevSource::new(config(&temp, &["127.0.0.1", "localhost"]), untrusted())
            .certified_key()
            .await
            .unwrap();
        assert_eq!(cert_der(&first), cert_der(&second));
    }

    #[tokio::test]
    async fn changed_names_trigger_reissue() {
        let temp = TempDir::new().unwrap();
        let first = DevSource::new(config(&temp, &["localhost"]), untrusted())
            .certified_key()
            .await
            .unwrap();
        let second = DevSource::new(config(&temp, &["localhost", "app.test"]), untrusted())
            .certified_key()
            .await
            .unwrap();
        assert_ne!(cert_der(&first), cert_der(&second));
    }

    #[tokio::test]
    async fn expired_cache_is_regenerated() {
        let temp = TempDir::new().unwrap();
        let source = DevSource::new(config(&temp, &["localhost"]), untrusted());
        let first = source.certified_key().await.unwrap();

        // Pretend the active leaf is about to expire and the file is gone.
        *source.active.write() = Some(ActiveLeaf {
            key: first.clone(),
            not_after: SystemTime::now() + Duration::from_secs(60),
        });
        std::fs::remove_file(temp.path().join("dev").join(ca::LEAF_CERT_FILENAME)).unwrap();

        let second = source.certified_key().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_ne!(cert_der(&first), cert_der(&second));
    }

    #[tokio::test]
    async fn trust_is_installed_once() {
        let temp = TempDir::new().unwrap();
        let fs_root = temp.path().join("fs");
        std::fs::create_dir_all(fs_root.join("usr/local/share/ca-certificates")).unwrap();
        let runner = Arc::new(CountingRunner::default());
        let installer = Arc::new(TrustInstaller::new(
            SystemTrust::detect_in(&fs_root),
            runner.clone(),
            false,
            Vec::new(),
        ));

        let mut cfg = config(&temp, &["localhost"]);
        cfg.install_trust = true;
        let source = DevSource::new(cfg, installer);

        source.certified_key().await.unwrap();
        source.root().await.unwrap();
        // cp + update-ca-certificates
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn trust_failure_is_fatal() {
        let temp = TempDir::new().unwrap();
        let mut cfg = config(&temp, &["localhost"]);
        cfg.install_trust = true;
        let source = DevSource::new(cfg, untrusted());

        assert!(matches!(
            source.certified_key().await,
            Err(DevError::Trust(TrustError::Unsupported(_)))
        ));
    }
}
