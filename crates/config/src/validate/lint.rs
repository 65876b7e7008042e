//! Configuration linting for best practices
//!
//! Checks configuration for missing best practices and potential issues.

use super::{ValidationResult, ValidationWarning};
use crate::{Config, LETSENCRYPT_STAGING};

/// Let's Encrypt certificates are valid for 90 days
const TYPICAL_VALIDITY_SECS: u64 = 90 * 86400;

/// Lint configuration for best practices
pub fn lint_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    if config.acme.email.is_none() {
        result.add_warning(ValidationWarning::new(
            "No acme contact email configured (expiry notices from the CA will not reach anyone)",
        ));
    }

    if config.acme.directory_url() == LETSENCRYPT_STAGING {
        result.add_warning(ValidationWarning::new(
            "Using the Let's Encrypt staging directory (issued certificates are not trusted)",
        ));
    }

    if config.policy.renew_before_expiry_secs >= TYPICAL_VALIDITY_SECS {
        result.add_warning(ValidationWarning::new(format!(
            "Renewal window of {} days is not shorter than a typical 90 day certificate",
            config.policy.renew_before_expiry_secs / 86400
        )));
    }

    if config.scheduler.tick_interval_secs > config.policy.renew_before_expiry_secs {
        result.add_warning(ValidationWarning::new(
            "Scheduler tick interval is longer than the renewal window",
        ));
    }

    if config.policy.max_retries == 0 {
        result.add_warning(ValidationWarning::new(
            "max-retries is 0: any failure parks a certificate until manual reset",
        ));
    }

    for cert in &config.certificates {
        if cert.hooks.is_empty() {
            if let Some(primary) = cert.domains.first() {
                result.add_warning(ValidationWarning::new(format!(
                    "Certificate '{}' has no hooks (dependent services will not reload)",
                    primary
                )));
            }
        }
    }

    result
}
