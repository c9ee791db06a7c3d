//! Warden Server - HTTPS with certificate selection and client fingerprinting
//!
//! The binary wires these modules together; they are exposed as a library so
//! integration tests can run a server in-process.

pub mod config;
pub mod defaults;
pub mod fingerprint;
pub mod http;
pub mod paths;
pub mod server;
pub mod tls;

pub use config::{Cli, Command, ConfigError, LogFormat, ServerConfig, SourceConfig};
pub use fingerprint::{ConnectionTag, FingerprintListener, FingerprintedStream};
pub use http::{AppHandler, ConnectionInfo, FingerprintEcho, client_fingerprint, connection_info};
pub use server::Server;
pub use tls::{AcmeRegistry, CertificateSource};

/// Install the process-wide rustls crypto provider once.
pub fn install_rustls_crypto_provider() {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return;
    }

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_rustls_crypto_provider_is_idempotent() {
        install_rustls_crypto_provider();
        install_rustls_crypto_provider();
        assert!(rustls::crypto::CryptoProvider::get_default().is_some());
    }
}
