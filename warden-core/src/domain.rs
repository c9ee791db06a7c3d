//! Configured domain specifications
//!
//! A domain spec is either an exact hostname (`example.com`) or a single-level
//! wildcard (`*.example.com`). Everything after the wildcard prefix must survive
//! strict IDNA ASCII encoding.

use std::fmt;
use thiserror::Error;

/// The wildcard glyph accepted in the leading label.
pub const WILDCARD: char = '*';

/// The label separator.
pub const SEPARATOR: char = '.';

const WILDCARD_PREFIX: &str = "*.";

/// Errors produced while validating a domain spec
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("Invalid domain: domain must not be empty")]
    Empty,

    #[error("Invalid domain '{0}': at most one wildcard is allowed")]
    MultipleWildcards(String),

    #[error("Invalid domain '{0}': wildcard must be the leading label")]
    WildcardNotLeading(String),

    #[error("Invalid domain '{0}': wildcard must be followed by '.'")]
    WildcardWithoutSeparator(String),

    #[error("Invalid domain '{domain}': {reason}")]
    Idna { domain: String, reason: String },
}

/// Validate a domain spec without constructing it.
pub fn validate(domain: &str) -> Result<(), DomainError> {
    DomainSpec::parse(domain).map(|_| ())
}

/// A validated domain spec. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainSpec {
    raw: String,
    /// ASCII-compatible form of the part after the wildcard prefix (or the
    /// whole name when there is no wildcard).
    ascii_base: String,
    wildcard: bool,
}

impl DomainSpec {
    pub fn parse(domain: &str) -> Result<Self, DomainError> {
        let domain = domain.trim();
        if domain.is_empty() {
            return Err(DomainError::Empty);
        }

        let wildcards = domain.matches(WILDCARD).count();
        if wildcards > 1 {
            return Err(DomainError::MultipleWildcards(domain.to_string()));
        }

        let (base, wildcard) = if wildcards == 1 {
            if !domain.starts_with(WILDCARD) {
                return Err(DomainError::WildcardNotLeading(domain.to_string()));
            }
            match domain.strip_prefix(WILDCARD_PREFIX) {
                Some(rest) => (rest, true),
                None => return Err(DomainError::WildcardWithoutSeparator(domain.to_string())),
            }
        } else {
            (domain, false)
        };

        let ascii_base = to_ascii(base).map_err(|reason| DomainError::Idna {
            domain: domain.to_string(),
            reason,
        })?;

        Ok(Self {
            raw: domain.to_string(),
            ascii_base,
            wildcard,
        })
    }

    /// The spec as it was configured (trimmed).
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    /// The ASCII-compatible name without any wildcard prefix.
    ///
    /// For `*.example.com` this is `example.com`, which the wildcard also
    /// authorizes.
    pub fn base_domain(&self) -> &str {
        &self.ascii_base
    }

    /// The normalized wildcard pattern (`*.example.com`), if any.
    pub fn wildcard_pattern(&self) -> Option<String> {
        self.wildcard
            .then(|| format!("{}{}", WILDCARD_PREFIX, self.ascii_base))
    }

    /// Names a certificate for this spec must cover.
    pub fn certificate_names(&self) -> Vec<String> {
        match self.wildcard_pattern() {
            Some(pattern) => vec![pattern, self.ascii_base.clone()],
            None => vec![self.ascii_base.clone()],
        }
    }
}

impl fmt::Display for DomainSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for DomainSpec {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Strict IDNA ASCII encoding (STD3 rules, DNS length checks).
pub(crate) fn to_ascii(name: &str) -> Result<String, String> {
    let ascii = idna::domain_to_ascii_strict(name).map_err(|e| e.to_string())?;
    if ascii.is_empty() {
        return Err("name is empty after IDNA encoding".to_string());
    }
    Ok(ascii)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_exact_domain() {
        let spec = DomainSpec::parse("example.com").unwrap();
        assert!(!spec.is_wildcard());
        assert_eq!(spec.base_domain(), "example.com");
        assert_eq!(spec.wildcard_pattern(), None);
    }

    #[test]
    fn accepts_single_wildcard() {
        let spec = DomainSpec::parse("*.example.com").unwrap();
        assert!(spec.is_wildcard());
        assert_eq!(spec.base_domain(), "example.com");
        assert_eq!(spec.wildcard_pattern().as_deref(), Some("*.example.com"));
        assert_eq!(
            spec.certificate_names(),
            vec!["*.example.com".to_string(), "example.com".to_string()]
        );
    }

    #[test]
    fn normalizes_case_and_unicode() {
        let spec = DomainSpec::parse("*.Bücher.Example").unwrap();
        assert_eq!(spec.base_domain(), "xn--bcher-kva.example");
        assert_eq!(spec.as_str(), "*.Bücher.Example");
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(validate(""), Err(DomainError::Empty));
        assert_eq!(validate("   "), Err(DomainError::Empty));
    }

    #[test]
    fn rejects_multiple_wildcards() {
        assert!(matches!(
            validate("*.*.example.com"),
            Err(DomainError::MultipleWildcards(_))
        ));
    }

    #[test]
    fn rejects_non_leading_wildcard() {
        assert!(matches!(
            validate("www.*.example.com"),
            Err(DomainError::WildcardNotLeading(_))
        ));
        assert!(matches!(
            validate("example.*"),
            Err(DomainError::WildcardNotLeading(_))
        ));
    }

    #[test]
    fn rejects_wildcard_without_separator() {
        assert!(matches!(
            validate("*example.com"),
            Err(DomainError::WildcardWithoutSeparator(_))
        ));
        assert!(matches!(
            validate("*"),
            Err(DomainError::WildcardWithoutSeparator(_))
        ));
    }

    #[test]
    fn rejects_idna_failures() {
        assert!(matches!(
            validate("bad_name.example.com"),
            Err(DomainError::Idna { .. })
        ));
        assert!(matches!(
            validate("*.under_score.com"),
            Err(DomainError::Idna { .. })
        ));
        assert!(matches!(validate("*."), Err(DomainError::Idna { .. })));
    }

    #[test]
    fn from_str_matches_parse() {
        let spec: DomainSpec = "*.example.com".parse().unwrap();
        assert_eq!(spec, DomainSpec::parse("*.example.com").unwrap());
    }
}
