//! Warden Core - Domain policy and client fingerprinting
//!
//! Pure logic shared by the Warden server: validating the configured domain,
//! deciding which TLS ServerNames may be served, parsing ClientHello records
//! and deriving JA3-style fingerprints from them.
//!
//! Nothing in this crate performs I/O.

mod client_hello;
mod domain;
mod fingerprint;
mod policy;

pub use client_hello::{ClientHelloError, ClientHelloSummary, encode_client_hello};
pub use domain::{DomainError, DomainSpec, SEPARATOR, WILDCARD, validate};
pub use fingerprint::{
    FINGERPRINT_NOT_FOUND, FingerprintSlot, GREASE, fingerprint, fingerprint_string, is_grease,
};
pub use policy::{AuthorizationDenied, HostPolicy, normalize_host};
