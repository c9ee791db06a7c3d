//! Command line and environment configuration

use crate::defaults::{LETS_ENCRYPT_PRODUCTION, LETS_ENCRYPT_STAGING};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use warden_core::{DomainError, DomainSpec};

/// Warden Server - HTTPS with ACME, disk or local-CA certificates
#[derive(Debug, Parser)]
#[command(name = "warden-server")]
#[command(version)]
#[command(about = "Warden Server - HTTPS with ACME, disk or local-CA certificates")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub serve: ServeArgs,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, env = "WARDEN_LOG_FORMAT", global = true)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Serve HTTPS (the default)
    Serve,
    /// Create the development root CA and add it to the system trust store
    InstallCa,
}

impl Command {
    /// Whether the command runs on the async runtime. `install-ca` is synchronous.
    pub fn needs_runtime(self) -> bool {
        matches!(self, Self::Serve)
    }
}

impl Cli {
    /// The subcommand to run, `serve` when none was given.
    pub fn command(&self) -> Command {
        self.command.unwrap_or(Command::Serve)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CertSourceKind {
    Acme,
    Disk,
    Dev,
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Domain to serve (`example.com` or `*.example.com`)
    #[arg(long, env = "WARDEN_DOMAIN", global = true)]
    pub domain: Option<String>,

    /// Where certificates come from
    #[arg(long, value_enum, env = "WARDEN_CERT_SOURCE", global = true)]
    pub cert_source: Option<CertSourceKind>,

    /// ACME contact email
    #[arg(long, env = "WARDEN_ACME_EMAIL", global = true)]
    pub acme_email: Option<String>,

    /// ACME directory URL
    #[arg(long, env = "WARDEN_ACME_DIRECTORY", default_value = LETS_ENCRYPT_PRODUCTION, global = true)]
    pub acme_directory: String,

    /// Use Let's Encrypt staging environment
    #[arg(long, env = "WARDEN_ACME_STAGING", global = true)]
    pub acme_staging: bool,

    /// Certificate chain for the disk source
    #[arg(long, env = "WARDEN_CERT_PATH", global = true)]
    pub cert_path: Option<PathBuf>,

    /// Private key for the disk source
    #[arg(long, env = "WARDEN_KEY_PATH", global = true)]
    pub key_path: Option<PathBuf>,

    /// Identity embedded in the development CA (default: user@hostname)
    #[arg(long, env = "WARDEN_HOST_IDENTITY", global = true)]
    pub host_identity: Option<String>,

    /// HTTPS listen address
    #[arg(long, env = "WARDEN_LISTEN", default_value = "0.0.0.0:443", global = true)]
    pub listen: SocketAddr,

    /// Plaintext listen address for ACME challenges
    #[arg(long, env = "WARDEN_HTTP_LISTEN", default_value = "0.0.0.0:80", global = true)]
    pub http_listen: SocketAddr,

    /// Data directory for certificates and ACME state
    #[arg(long, env = "WARDEN_DATA_DIR", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Do not touch the system trust store
    #[arg(long, env = "WARDEN_SKIP_TRUST_INSTALL", global = true)]
    pub skip_trust_install: bool,

    /// Certificate renewal check interval in hours
    #[arg(long, default_value_t = 12, global = true)]
    pub renewal_interval_hours: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("--cert-source is required (acme, disk or dev)")]
    MissingSource,

    #[error("--domain is required for the {0} certificate source")]
    MissingDomain(&'static str),

    #[error("--acme-email is required for the acme certificate source")]
    MissingEmail,

    #[error("--cert-path and --key-path are required for the disk certificate source")]
    MissingDiskPaths,

    #[error("Could not determine the Warden home directory: {0}")]
    Home(#[from] std::io::Error),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Active certificate strategy and its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceConfig {
    Acme {
        domain: DomainSpec,
        directory_url: String,
        email: String,
    },
    Disk {
        cert_path: PathBuf,
        key_path: PathBuf,
    },
    Dev {
        domain: DomainSpec,
    },
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub source: SourceConfig,
    pub listen: SocketAddr,
    /// Only set for the ACME source.
    pub http_listen: Option<SocketAddr>,
    pub data_dir: PathBuf,
    pub ca_dir: PathBuf,
    pub host_identity: String,
    pub install_trust: bool,
}

impl ServerConfig {
    pub fn from_args(args: &ServeArgs) -> Result<Self, ConfigError> {
        let kind = args.cert_source.ok_or(ConfigError::MissingSource)?;
        let domain = args
            .domain
            .as_deref()
            .map(DomainSpec::parse)
            .transpose()?;

        let source = match kind {
            CertSourceKind::Acme => {
                let domain = domain.ok_or(ConfigError::MissingDomain("acme"))?;
                let email = args
                    .acme_email
                    .clone()
                    .filter(|e| !e.trim().is_empty())
                    .ok_or(ConfigError::MissingEmail)?;
                let directory_url = if args.acme_staging {
                    LETS_ENCRYPT_STAGING.to_string()
                } else {
                    args.acme_directory.clone()
                };
                SourceConfig::Acme {
                    domain,
                    directory_url,
                    email,
                }
            }
            CertSourceKind::Disk => match (&args.cert_path, &args.key_path) {
                (Some(cert_path), Some(key_path)) => SourceConfig::Disk {
                    cert_path: cert_path.clone(),
                    key_path: key_path.clone(),
                },
                _ => return Err(ConfigError::MissingDiskPaths),
            },
            CertSourceKind::Dev => SourceConfig::Dev {
                domain: domain.ok_or(ConfigError::MissingDomain("dev"))?,
            },
        };

        let http_listen = matches!(source, SourceConfig::Acme { .. }).then_some(args.http_listen);

        let data_dir = match &args.data_dir {
            Some(dir) => dir.clone(),
            None => crate::paths::default_data_dir()?,
        };

        Ok(Self {
            source,
            listen: args.listen,
            http_listen,
            data_dir,
            ca_dir: crate::paths::ca_dir()?,
            host_identity: args
                .host_identity
                .clone()
                .unwrap_or_else(default_host_identity),
            install_trust: !args.skip_trust_install,
        })
    }
}

impl ServeArgs {
    pub fn renewal_interval(&self) -> Duration {
        Duration::from_secs(self.renewal_interval_hours.max(1) * 60 * 60)
    }
}

/// `user@hostname` for the current process.
pub fn default_host_identity() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{user}@{host}")
}
