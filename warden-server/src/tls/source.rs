//! Certificate source selected for the process lifetime
//!
//! Exactly one variant is active. Each handshake asks it for a signing key
//! given the ServerName the client sent (if any).

use super::acme::{AcmeConfig, AcmeError, AcmeManager, AcmeRegistry, ChallengeHandler};
use super::dev::{DevError, DevSource, DevSourceConfig, dev_certificate_names};
use super::pem::{self, PemError};
use super::trust::TrustInstaller;
use crate::config::{ServerConfig, SourceConfig};
use rustls::sign::CertifiedKey;
use std::sync::Arc;
use thiserror::Error;
use warden_core::AuthorizationDenied;

/// Why a handshake could not be given a certificate.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Client did not send a server name")]
    MissingServerName,

    #[error(transparent)]
    Denied(#[from] AuthorizationDenied),

    #[error(transparent)]
    Acme(AcmeError),

    #[error(transparent)]
    Dev(#[from] DevError),
}

impl From<AcmeError> for ResolveError {
    fn from(err: AcmeError) -> Self {
        match err {
            AcmeError::Denied(denied) => Self::Denied(denied),
            other => Self::Acme(other),
        }
    }
}

/// Startup failures while building or warming a source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to load certificate from disk: {0}")]
    Disk(#[from] PemError),

    #[error("Failed to prepare development certificate: {0}")]
    Dev(#[from] DevError),
}

#[derive(Clone)]
pub enum CertificateSource {
    Acme(Arc<AcmeManager>),
    Disk(Arc<CertifiedKey>),
    Dev(Arc<DevSource>),
}

impl std::fmt::Debug for CertificateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CertificateSource").field(&self.kind()).finish()
    }
}

impl CertificateSource {
    /// Build the source named by `config`. Disk certificates are loaded here.
    pub fn build(config: &ServerConfig, registry: &AcmeRegistry) -> Result<Self, SourceError> {
        match &config.source {
            SourceConfig::Acme {
                domain,
                directory_url,
                email,
            } => {
                let acme = AcmeConfig::new(
                    directory_url.clone(),
                    email.clone(),
                    config.data_dir.join("acme"),
                );
                Ok(Self::Acme(registry.get_or_create(domain, acme)))
            }
            SourceConfig::Disk {
                cert_path,
                key_path,
            } => {
                let key = pem::load_certified_key(cert_path, key_path)?;
                tracing::info!(cert = %cert_path.display(), "Loaded certificate from disk");
                Ok(Self::Disk(Arc::new(key)))
            }
            SourceConfig::Dev { domain } => {
                let dev = DevSourceConfig {
                    ca_dir: config.ca_dir.clone(),
                    leaf_dir: config.data_dir.join("dev"),
                    host_identity: config.host_identity.clone(),
                    names: dev_certificate_names(domain),
                    install_trust: config.install_trust,
                };
                Ok(Self::Dev(Arc::new(DevSource::new(
                    dev,
                    Arc::new(TrustInstaller::for_host()),
                ))))
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Acme(_) => "acme",
            Self::Disk(_) => "disk",
            Self::Dev(_) => "dev",
        }
    }

    /// Warm the source before accepting connections.
    ///
    /// The dev root, its trust installation and the first leaf must succeed.
    /// An unreachable ACME directory is only logged; the next handshake retries.
    pub async fn prepare(&self) -> Result<(), SourceError> {
        match self {
            Self::Acme(manager) => {
                if let Err(e) = manager.init().await {
                    tracing::warn!(error = %e, "ACME account not ready, will retry on first handshake");
                }
                Ok(())
            }
            Self::Disk(_) => Ok(()),
            Self::Dev(dev) => {
                dev.certified_key().await?;
                Ok(())
            }
        }
    }

    /// Signing key for a handshake that sent `server_name`.
    pub async fn resolve(
        &self,
        server_name: Option<&str>,
    ) -> Result<Arc<CertifiedKey>, ResolveError> {
        match self {
            Self::Acme(manager) => {
                let host = server_name.ok_or(ResolveError::MissingServerName)?;
                Ok(manager.resolve(host).await?)
            }
            Self::Disk(key) => Ok(key.clone()),
            Self::Dev(dev) => Ok(dev.certified_key().await?),
        }
    }

    /// HTTP-01 responder for the plaintext listener, ACME only.
    pub fn challenge_handler(&self) -> Option<ChallengeHandler> {
        match self {
            Self::Acme(manager) => Some(ChallengeHandler::new(manager.challenge_tokens())),
            _ => None,
        }
    }

    pub fn acme_manager(&self) -> Option<&Arc<AcmeManager>> {
        match self {
            Self::Acme(manager) => Some(manager),
            _ => None,
        }
    }
}
