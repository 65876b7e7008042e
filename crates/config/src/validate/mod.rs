//! Configuration validation
//!
//! Validation never stops at the first problem: every check contributes to
//! a [`ValidationResult`] holding hard errors and advisory warnings.

mod certs;
mod lint;

use std::fmt;

use crate::Config;

pub use certs::validate_certificates;
pub use lint::lint_config;

/// Area of the configuration an error belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Certificate,
    Hook,
    Acme,
    Scheduler,
    Policy,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Certificate => "certificate",
            ErrorCategory::Hook => "hook",
            ErrorCategory::Acme => "acme",
            ErrorCategory::Scheduler => "scheduler",
            ErrorCategory::Policy => "policy",
        };
        f.write_str(name)
    }
}

/// Hard validation failure
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub category: ErrorCategory,
    pub message: String,
}

impl ValidationError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

/// Advisory finding
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub message: String,
}

impl ValidationWarning {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Accumulated errors and warnings
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Longest accepted value for any duration setting (ten years)
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 86400;

/// Largest accepted job pool
pub const MAX_POOL_SIZE: usize = 1024;

/// Run every validation pass
pub fn validate_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    check_bounds(config, &mut result);

    if config.scheduler.pool_size == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Scheduler,
            "pool-size must be at least 1",
        ));
    }

    if config.scheduler.tick_interval_secs == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Scheduler,
            "tick-interval-secs must be at least 1",
        ));
    }

    if config.acme.request_timeout_secs == 0 {
        result.add_error(ValidationError::new(
            ErrorCategory::Acme,
            "request-timeout-secs must be at least 1",
        ));
    }

    for (name, hook) in &config.hooks {
        if hook.command.trim().is_empty() {
            result.add_error(ValidationError::new(
                ErrorCategory::Hook,
                format!("Hook '{}' has an empty command", name),
            ));
        }
        if hook.timeout_secs == 0 {
            result.add_error(ValidationError::new(
                ErrorCategory::Hook,
                format!("Hook '{}' timeout-secs must be at least 1", name),
            ));
        }
    }

    result.merge(validate_certificates(config));
    result.merge(lint_config(config));
    result
}

fn check_bounds(config: &Config, result: &mut ValidationResult) {
    let scheduler = &config.scheduler;
    let acme = &config.acme;
    let backoff = &config.policy.retry_backoff;

    let durations = [
        (ErrorCategory::Scheduler, "tick-interval-secs", scheduler.tick_interval_secs),
        (ErrorCategory::Scheduler, "horizon-secs", scheduler.horizon_secs),
        (ErrorCategory::Scheduler, "shutdown-timeout-secs", scheduler.shutdown_timeout_secs),
        (ErrorCategory::Acme, "dns-propagation-secs", acme.dns_propagation_secs),
        (ErrorCategory::Acme, "request-timeout-secs", acme.request_timeout_secs),
        (ErrorCategory::Acme, "default-retry-after-secs", acme.default_retry_after_secs),
        (ErrorCategory::Acme, "poll-interval-secs", acme.poll_interval_secs),
        (ErrorCategory::Policy, "renew-before-secs", config.policy.renew_before_expiry_secs),
        (ErrorCategory::Policy, "backoff-base-secs", backoff.base_secs),
        (ErrorCategory::Policy, "backoff-max-secs", backoff.max_secs),
    ];
    for (category, name, secs) in durations {
        if secs > MAX_DURATION_SECS {
            result.add_error(ValidationError::new(
                category,
                format!("{} must be at most {} (ten years), got {}", name, MAX_DURATION_SECS, secs),
            ));
        }
    }

    for (name, hook) in &config.hooks {
        if hook.timeout_secs > MAX_DURATION_SECS {
            result.add_error(ValidationError::new(
                ErrorCategory::Hook,
                format!("Hook '{}' timeout-secs must be at most {}", name, MAX_DURATION_SECS),
            ));
        }
    }

    for cert in &config.certificates {
        if cert.renew_before_days.is_some_and(|days| u64::from(days) * 86400 > MAX_DURATION_SECS) {
            result.add_error(ValidationError::new(
                ErrorCategory::Certificate,
                format!("Certificate {:?} renew-before-days exceeds ten years", cert.domains),
            ));
        }
    }

    if scheduler.pool_size > MAX_POOL_SIZE {
        result.add_error(ValidationError::new(
            ErrorCategory::Scheduler,
            format!("pool-size must be at most {}, got {}", MAX_POOL_SIZE, scheduler.pool_size),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HookConfig;

    #[test]
    fn test_default_config_is_valid() {
        let result = validate_config(&Config::default());
        assert!(result.is_ok(), "{:?}", result.errors);
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let mut config = Config::default();
        config.scheduler.pool_size = 0;

        let result = validate_config(&config);
        assert!(result
            .errors
            .iter()
            .any(|e| e.category == ErrorCategory::Scheduler));
    }

    #[test]
    fn test_empty_hook_command_rejected() {
        let mut config = Config::default();
        config
            .hooks
            .insert("noop".to_string(), HookConfig::new("   "));

        let result = validate_config(&config);
        assert!(result.errors.iter().any(|e| e.message.contains("empty command")));
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let mut config = Config::default();
        config.scheduler.horizon_secs = u64::MAX;
        config.policy.retry_backoff.max_secs = MAX_DURATION_SECS + 1;
        config.scheduler.pool_size = MAX_POOL_SIZE + 1;

        let result = validate_config(&config);
        assert_eq!(result.errors.len(), 3);
        assert!(result.errors.iter().any(|e| e.message.contains("horizon-secs")));
        assert!(result
            .errors
            .iter()
            .any(|e| e.category == ErrorCategory::Policy));

        config.scheduler.horizon_secs = MAX_DURATION_SECS;
        config.policy.retry_backoff.max_secs = 86400;
        config.scheduler.pool_size = MAX_POOL_SIZE;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_fails_with_error_summary() {
        let mut config = Config::default();
        config.scheduler.pool_size = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("1 error(s)"));
    }
}
