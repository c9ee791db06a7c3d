//! TLS/Certificate management
//!
//! Handles:
//! - ACME (Let's Encrypt) certificate issuance via HTTP-01 challenge
//! - Certificates loaded from disk
//! - A local development CA, its trust installation and short-lived leaves
//! - Per-connection rustls configuration built around the resolved key

pub mod acme;
pub mod ca;
pub mod dev;
pub mod pem;
pub mod source;
pub mod trust;

pub use acme::{
    AcmeConfig, AcmeError, AcmeManager, AcmeRegistry, ChallengeHandler, ChallengeTokens,
    renewal_task,
};
pub use ca::{CaError, LeafPaths, RootCa, ensure_root_ca, issue_leaf};
pub use dev::{DevError, DevSource, DevSourceConfig, dev_certificate_names};
pub use pem::{PemError, certified_key_from_pem, load_certified_key};
pub use source::{CertificateSource, ResolveError, SourceError};
pub use trust::{TrustError, TrustInstaller, TrustOutcome};

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::sync::Arc;

pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

/// Serves the one key chosen for this connection.
#[derive(Debug)]
struct ResolvedKey(Arc<CertifiedKey>);

impl ResolvesServerCert for ResolvedKey {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// rustls server configuration presenting `key`, offering h2 and http/1.1.
pub fn server_config(key: Arc<CertifiedKey>) -> Result<Arc<rustls::ServerConfig>, rustls::Error> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(ResolvedKey(key)));
    config.alpn_protocols = vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()];
    Ok(Arc::new(config))
}
