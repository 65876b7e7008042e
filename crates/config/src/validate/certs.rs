//! Certificate declaration validation
//!
//! Validates domain names, duplicate coverage, hook references and that the
//! selected challenge has a responder configured.
//!
//! http-01 needs a webroot: the daemon itself listens on no port, so tokens
//! are only reachable through files a web server already serves.

use std::collections::{HashMap, HashSet};

use warden_common::{ChallengeKind, DomainSet};

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;

/// Validate declared certificates
pub fn validate_certificates(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let mut owners: HashMap<String, String> = HashMap::new();
    let mut ids: HashSet<String> = HashSet::new();

    for cert in &config.certificates {
        let set = match DomainSet::validated(&cert.domains) {
            Ok(set) => set,
            Err(e) => {
                result.add_error(ValidationError::new(
                    ErrorCategory::Certificate,
                    format!("Certificate {:?}: {}", cert.domains, e),
                ));
                continue;
            }
        };
        let id = set.primary().to_string();

        if !ids.insert(id.clone()) {
            result.add_error(ValidationError::new(
                ErrorCategory::Certificate,
                format!("Certificate '{}' is declared more than once", id),
            ));
            continue;
        }

        for domain in set.iter() {
            if let Some(other) = owners.insert(domain.to_string(), id.clone()) {
                if other != id {
                    result.add_warning(ValidationWarning::new(format!(
                        "Domain '{}' is covered by both '{}' and '{}'",
                        domain, other, id
                    )));
                }
            }
        }

        for hook in &cert.hooks {
            if !config.hooks.contains_key(hook) {
                result.add_error(ValidationError::new(
                    ErrorCategory::Hook,
                    format!("Certificate '{}' references undefined hook '{}'", id, hook),
                ));
            }
        }

        let challenge = cert.challenge.unwrap_or(config.acme.challenge);
        match challenge {
            ChallengeKind::Dns01 if !config.acme.has_dns_responder() => {
                result.add_error(ValidationError::new(
                    ErrorCategory::Acme,
                    format!(
                        "Certificate '{}' uses dns-01 but acme has no dns-present/dns-cleanup commands",
                        id
                    ),
                ));
            }
            ChallengeKind::Http01 if set.iter().any(|d| d.starts_with("*.")) => {
                result.add_error(ValidationError::new(
                    ErrorCategory::Certificate,
                    format!(
                        "Certificate '{}' contains a wildcard, which requires dns-01",
                        id
                    ),
                ));
            }
            ChallengeKind::Http01 if config.acme.webroot.is_none() => {
                result.add_error(ValidationError::new(
                    ErrorCategory::Acme,
                    format!(
                        "Certificate '{}' uses http-01 but acme has no webroot to publish tokens in",
                        id
                    ),
                ));
            }
            _ => {}
        }
    }

    result
}
