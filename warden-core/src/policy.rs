//! Host authorization policy
//!
//! Compiles a [`DomainSpec`] into a predicate over TLS ServerName values.
//! Wildcards match exactly one label, mirroring what a CA will issue for a
//! single wildcard certificate.

use crate::domain::{DomainError, DomainSpec, SEPARATOR, WILDCARD};
use thiserror::Error;

/// Returned when a hostname is not covered by the configured domain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("host {host:?} is not authorized by the configured domain")]
pub struct AuthorizationDenied {
    pub host: String,
}

/// Stateless host policy. Cheap to clone and safe to share across handshakes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPolicy {
    exact: String,
    wildcard: Option<String>,
}

impl HostPolicy {
    /// Validate `domain` and compile it into a policy.
    pub fn build(domain: &str) -> Result<Self, DomainError> {
        DomainSpec::parse(domain).map(|spec| Self::new(&spec))
    }

    pub fn new(spec: &DomainSpec) -> Self {
        Self {
            exact: spec.base_domain().to_string(),
            wildcard: spec.wildcard_pattern(),
        }
    }

    /// Decide whether `host` may be served.
    pub fn check(&self, host: &str) -> Result<(), AuthorizationDenied> {
        let normalized = normalize_host(host);

        if !normalized.is_empty() && normalized == self.exact {
            return Ok(());
        }

        if let Some(pattern) = &self.wildcard
            && matches_single_level(&normalized, pattern)
        {
            return Ok(());
        }

        Err(AuthorizationDenied {
            host: host.to_string(),
        })
    }

    pub fn is_allowed(&self, host: &str) -> bool {
        self.check(host).is_ok()
    }

    /// The name that matches exactly (the bare base domain for wildcards).
    pub fn exact_match(&self) -> &str {
        &self.exact
    }

    pub fn wildcard_pattern(&self) -> Option<&str> {
        self.wildcard.as_deref()
    }
}

/// Trim surrounding whitespace and a trailing root dot, then lowercase.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim();
    host.strip_suffix(SEPARATOR).unwrap_or(host).to_ascii_lowercase()
}

fn matches_single_level(host: &str, pattern: &str) -> bool {
    // A literal glyph in the ServerName would trivially match its own position.
    if host.is_empty() || host.contains(WILDCARD) {
        return false;
    }

    let labels: Vec<&str> = host.split(SEPARATOR).collect();
    if labels.iter().any(|label| label.is_empty()) {
        return false;
    }

    let glyph = WILDCARD.to_string();
    (0..labels.len()).any(|i| {
        let mut candidate = labels.clone();
        candidate[i] = glyph.as_str();
        candidate.join(".") == pattern
    })
}
