//! Type-safe identifiers for managed certificates.
//!
//! These types provide compile-time safety for identifiers, preventing
//! accidental mixing of a certificate ID with an arbitrary domain string,
//! and guarantee that a [`DomainSet`] is never empty and never repeats a name.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Maximum length of a DNS name in presentation format
const MAX_DOMAIN_LEN: usize = 253;

/// Maximum length of a single DNS label
const MAX_LABEL_LEN: usize = 63;

/// Domain validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("domain set must contain at least one domain")]
    Empty,

    #[error("domain listed more than once: {0}")]
    Duplicate(String),

    #[error("invalid domain '{domain}': {reason}")]
    Invalid { domain: String, reason: &'static str },
}

/// Certificate identifier.
///
/// Identifies one managed certificate. By convention this is the primary
/// (first) domain of the certificate's [`DomainSet`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CertificateId(String);

impl CertificateId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CertificateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CertificateId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for CertificateId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Ordered set of distinct subject names covered by one certificate.
///
/// The first entry is the primary domain, the rest are SANs. Names are
/// normalized to lowercase on construction, and a name given twice is
/// rejected rather than merged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct DomainSet(Vec<String>);

impl DomainSet {
    /// Build a domain set, rejecting empty sets and duplicates.
    ///
    /// Only structural checks happen here; per-name syntax checks live in
    /// [`validate_domain`] and are applied by [`DomainSet::validated`].
    pub fn new<I, S>(domains: I) -> Result<Self, DomainError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut names: Vec<String> = Vec::new();
        for domain in domains {
            let name = domain.as_ref().trim().to_ascii_lowercase();
            if names.contains(&name) {
                return Err(DomainError::Duplicate(name));
            }
            names.push(name);
        }

        if names.is_empty() {
            return Err(DomainError::Empty);
        }

        Ok(Self(names))
    }

    /// Build a domain set and validate every name.
    pub fn validated<I, S>(domains: I) -> Result<Self, DomainError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set = Self::new(domains)?;
        for name in &set.0 {
            validate_domain(name)?;
        }
        Ok(set)
    }

    /// The primary domain (first entry)
    pub fn primary(&self) -> &str {
        &self.0[0]
    }

    /// Identifier derived from the primary domain
    pub fn certificate_id(&self) -> CertificateId {
        CertificateId::new(self.primary())
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.0.iter().any(|d| d.eq_ignore_ascii_case(domain))
    }
}

impl fmt::Display for DomainSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(","))
    }
}

impl TryFrom<Vec<String>> for DomainSet {
    type Error = DomainError;

    fn try_from(value: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DomainSet> for Vec<String> {
    fn from(set: DomainSet) -> Self {
        set.0
    }
}

/// Validate a single DNS name for certificate issuance.
///
/// Accepts a single leading `*.` wildcard label. IP literals are rejected
/// since ACME IP identifiers are not supported.
pub fn validate_domain(domain: &str) -> Result<(), DomainError> {
    let invalid = |reason| DomainError::Invalid {
        domain: domain.to_string(),
        reason,
    };

    if domain.is_empty() {
        return Err(invalid("domain cannot be empty"));
    }

    if domain.len() > MAX_DOMAIN_LEN {
        return Err(invalid("domain exceeds 253 characters"));
    }

    if domain.contains(char::is_whitespace) {
        return Err(invalid("domain cannot contain spaces"));
    }

    if domain.starts_with('.') || domain.ends_with('.') {
        return Err(invalid("domain cannot start or end with a dot"));
    }

    if domain.parse::<std::net::IpAddr>().is_ok() {
        return Err(invalid("IP addresses are not supported"));
    }

    let name = domain.strip_prefix("*.").unwrap_or(domain);
    if !name.contains('.') {
        return Err(invalid("domain must have at least two labels"));
    }

    for label in name.split('.') {
        if label.is_empty() {
            return Err(invalid("domain contains an empty label"));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(invalid("label exceeds 63 characters"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(invalid("label cannot start or end with a hyphen"));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(invalid("label contains invalid characters"));
        }
    }

    Ok(())
}
