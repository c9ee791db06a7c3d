//! JA3-style TLS client fingerprints
//!
//! The fingerprint string is `version,ciphers,extensions,curves,points`, with
//! list items joined by `-` and GREASE values removed. The extension field is
//! always empty. The string is hashed with 64-bit FNV-1a and rendered as 16
//! lowercase hex digits.

use std::sync::OnceLock;

use crate::client_hello::ClientHelloSummary;

/// Value reported when a connection has no fingerprint.
pub const FINGERPRINT_NOT_FOUND: &str = "not found";

/// Reserved GREASE values (RFC 8701).
pub const GREASE: [u16; 16] = [
    0x0a0a, 0x1a1a, 0x2a2a, 0x3a3a, 0x4a4a, 0x5a5a, 0x6a6a, 0x7a7a, 0x8a8a, 0x9a9a, 0xaaaa, 0xbaba,
    0xcaca, 0xdada, 0xeaea, 0xfafa,
];

pub fn is_grease(value: u16) -> bool {
    GREASE.contains(&value)
}

/// Build the fingerprint string.
pub fn fingerprint_string(
    versions: &[u16],
    cipher_suites: &[u16],
    curves: &[u16],
    point_formats: &[u8],
) -> String {
    let max_version = versions
        .iter()
        .copied()
        .filter(|v| !is_grease(*v))
        .max()
        .unwrap_or(0);

    format!(
        "{},{},,{},{}",
        max_version,
        join_filtered(cipher_suites),
        join_filtered(curves),
        point_formats
            .iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join("-"),
    )
}

/// Hash the fingerprint string for the given handshake metadata.
pub fn fingerprint(
    versions: &[u16],
    cipher_suites: &[u16],
    curves: &[u16],
    point_formats: &[u8],
) -> String {
    fnv1a_hex(&fingerprint_string(
        versions,
        cipher_suites,
        curves,
        point_formats,
    ))
}

impl ClientHelloSummary {
    pub fn fingerprint(&self) -> String {
        fingerprint(
            &self.versions,
            &self.cipher_suites,
            &self.curves,
            &self.point_formats,
        )
    }
}

fn join_filtered(values: &[u16]) -> String {
    values
        .iter()
        .filter(|v| !is_grease(**v))
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join("-")
}

fn fnv1a_hex(input: &str) -> String {
    let mut hash: u64 = 0xcbf29ce484222325; // FNV-1a offset basis
    for byte in input.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3); // FNV-1a prime
    }
    format!("{hash:016x}")
}

/// Single-assignment holder for a connection's fingerprint.
///
/// The first `set` wins; later writes are ignored.
#[derive(Debug, Default)]
pub struct FingerprintSlot {
    value: OnceLock<String>,
}

impl FingerprintSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the fingerprint. Returns `false` if one was already stored.
    pub fn set(&self, fingerprint: String) -> bool {
        self.value.set(fingerprint).is_ok()
    }

    pub fn get(&self) -> Option<&str> {
        self.value.get().map(String::as_str)
    }

    pub fn get_or_not_found(&self) -> &str {
        self.get().unwrap_or(FINGERPRINT_NOT_FOUND)
    }
}
