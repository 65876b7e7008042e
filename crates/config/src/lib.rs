//! Configuration for the Warden certificate lifecycle manager.
//!
//! Configuration is written in KDL:
//!
//! ```kdl
//! storage {
//!     path "/var/lib/warden"
//! }
//!
//! acme {
//!     email "admin@example.com"
//!     staging #false
//!     challenge "http-01"
//!     webroot "/var/www/acme"
//! }
//!
//! hooks {
//!     hook "reload-proxy" {
//!         command "systemctl reload nginx"
//!         timeout-secs 30
//!     }
//! }
//!
//! certificate "example.com" {
//!     domains "example.com" "www.example.com"
//!     hooks "reload-proxy"
//! }
//! ```
//!
//! Every block is optional; missing values fall back to the defaults
//! documented on each field.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use warden_common::{ChallengeKind, RenewalPolicy};

pub mod kdl;
pub mod validate;

pub use validate::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};

/// Let's Encrypt production directory
pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Configuration used when no file is given
const DEFAULT_CONFIG: &str = r#"
storage {
    path "/var/lib/warden"
}

acme {
    staging #true
    challenge "http-01"
    webroot "/var/www/acme"
}

scheduler {
    tick-interval-secs 43200
    pool-size 4
}

logging {
    level "info"
    format "pretty"
}
"#;

// ============================================================================
// Top-level Configuration
// ============================================================================

/// Complete service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub acme: AcmeConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Default renewal policy for certificates without an override
    #[serde(default)]
    pub policy: RenewalPolicy,

    /// Post-issuance hooks by name
    #[serde(default)]
    pub hooks: BTreeMap<String, HookConfig>,

    /// Certificates declared in configuration
    #[serde(default)]
    pub certificates: Vec<ManagedCertificateConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load configuration from a KDL file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;

        let config = Self::from_kdl(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;

        info!(
            path = %path.display(),
            certificates = config.certificates.len(),
            hooks = config.hooks.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse configuration from a KDL string
    pub fn from_kdl(content: &str) -> Result<Self> {
        let doc: ::kdl::KdlDocument = content.parse().map_err(|e: ::kdl::KdlError| {
            let report = miette::Report::new(e);
            anyhow::anyhow!("Failed to parse KDL configuration:\n{:?}", report)
        })?;

        crate::kdl::parse_document(&doc)
    }

    /// Embedded default configuration
    pub fn default_embedded() -> Result<Self> {
        debug!("Loading embedded default configuration");
        Self::from_kdl(DEFAULT_CONFIG)
    }

    /// Validate the configuration, failing on any error.
    ///
    /// Warnings are logged but do not fail validation.
    pub fn validate(&self) -> Result<ValidationResult> {
        let result = validate::validate_config(self);
        for warning in &result.warnings {
            tracing::warn!(warning = %warning.message, "Configuration warning");
        }

        if !result.errors.is_empty() {
            let messages: Vec<String> = result.errors.iter().map(|e| e.to_string()).collect();
            anyhow::bail!(
                "Configuration has {} error(s):\n  - {}",
                messages.len(),
                messages.join("\n  - ")
            );
        }
        Ok(result)
    }

    /// Effective policy for a declared certificate
    pub fn policy_for(&self, cert: &ManagedCertificateConfig) -> RenewalPolicy {
        let mut policy = self.policy.clone();
        if let Some(days) = cert.renew_before_days {
            policy = policy.with_renew_before_days(days);
        }
        if let Some(max_retries) = cert.max_retries {
            policy = policy.with_max_retries(max_retries);
        }
        policy
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Durable state location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for records, artifacts and account credentials
    #[serde(default = "default_storage_path")]
    pub path: PathBuf,
}

pub(crate) fn default_storage_path() -> PathBuf {
    PathBuf::from("/var/lib/warden")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

// ============================================================================
// ACME
// ============================================================================

/// Certificate authority settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeConfig {
    /// Contact email registered with the account
    #[serde(default)]
    pub email: Option<String>,

    /// Explicit directory URL; overrides `staging`
    #[serde(default)]
    pub directory: Option<String>,

    /// Use the Let's Encrypt staging environment
    #[serde(default)]
    pub staging: bool,

    /// Default challenge type
    #[serde(default)]
    pub challenge: ChallengeKind,

    /// Directory under which `.well-known/acme-challenge/` files are written
    #[serde(default)]
    pub webroot: Option<PathBuf>,

    /// Shell command creating the DNS-01 TXT record
    #[serde(default)]
    pub dns_present: Option<String>,

    /// Shell command removing the DNS-01 TXT record
    #[serde(default)]
    pub dns_cleanup: Option<String>,

    /// Wait after creating a TXT record before asking for validation
    #[serde(default = "default_dns_propagation_secs")]
    pub dns_propagation_secs: u64,

    /// Deadline for every individual authority interaction
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Retry-after assumed when a rate limit response carries none
    #[serde(default = "default_retry_after_secs")]
    pub default_retry_after_secs: u64,

    /// Interval between validation polls
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Number of validation polls before giving up
    #[serde(default = "default_poll_attempts")]
    pub poll_attempts: u32,
}

fn default_dns_propagation_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_retry_after_secs() -> u64 {
    3600
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_poll_attempts() -> u32 {
    30
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            email: None,
            directory: None,
            staging: false,
            challenge: ChallengeKind::default(),
            webroot: None,
            dns_present: None,
            dns_cleanup: None,
            dns_propagation_secs: default_dns_propagation_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            default_retry_after_secs: default_retry_after_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            poll_attempts: default_poll_attempts(),
        }
    }
}

impl AcmeConfig {
    /// Directory URL to contact
    pub fn directory_url(&self) -> &str {
        match (&self.directory, self.staging) {
            (Some(url), _) => url,
            (None, true) => LETSENCRYPT_STAGING,
            (None, false) => LETSENCRYPT_PRODUCTION,
        }
    }

    /// Whether a DNS-01 responder is configured
    pub fn has_dns_responder(&self) -> bool {
        self.dns_present.is_some() && self.dns_cleanup.is_some()
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Renewal scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between renewal checks
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Maximum number of concurrent certificate jobs
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Extra look-ahead added to every renewal window
    #[serde(default)]
    pub horizon_secs: u64,

    /// Grace period on shutdown for challenge cleanup and running hooks;
    /// in-flight jobs are cancelled at once
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_tick_interval_secs() -> u64 {
    12 * 3600
}

fn default_pool_size() -> usize {
    4
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            pool_size: default_pool_size(),
            horizon_secs: 0,
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

// ============================================================================
// Hooks
// ============================================================================

/// Post-issuance action
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookConfig {
    /// Shell command, run through `sh -c`
    pub command: String,

    /// Deadline for a single run
    #[serde(default = "default_hook_timeout_secs")]
    pub timeout_secs: u64,

    /// Attempts after the first failure
    #[serde(default = "default_hook_retries")]
    pub retries: u32,
}

fn default_hook_timeout_secs() -> u64 {
    30
}

fn default_hook_retries() -> u32 {
    3
}

impl HookConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout_secs: default_hook_timeout_secs(),
            retries: default_hook_retries(),
        }
    }
}

// ============================================================================
// Managed Certificates
// ============================================================================

/// Certificate declared in configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagedCertificateConfig {
    /// Subject names, primary first
    pub domains: Vec<String>,

    /// Challenge override
    #[serde(default)]
    pub challenge: Option<ChallengeKind>,

    /// Hooks to notify after issuance
    #[serde(default)]
    pub hooks: Vec<String>,

    /// Renewal window override in days
    #[serde(default)]
    pub renew_before_days: Option<u32>,

    /// Retry budget override
    #[serde(default)]
    pub max_retries: Option<u32>,
}

// ============================================================================
// Logging and Metrics
// ============================================================================

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging settings; `RUST_LOG` takes precedence over `level`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Metrics export settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Prometheus textfile written after every scheduler tick
    #[serde(default)]
    pub textfile: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_embedded() {
        let config = Config::default_embedded().unwrap();
        assert!(config.acme.staging);
        assert_eq!(config.acme.directory_url(), LETSENCRYPT_STAGING);
        assert_eq!(config.scheduler.pool_size, 4);
        assert!(config.certificates.is_empty());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.kdl");
        std::fs::write(
            &path,
            r#"
            acme { email "ops@example.com" }
            certificate "example.com" { domains "example.com" "www.example.com" }
            "#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.acme.email.as_deref(), Some("ops@example.com"));
        assert_eq!(config.acme.directory_url(), LETSENCRYPT_PRODUCTION);
        assert_eq!(config.certificates.len(), 1);
    }

    #[test]
    fn test_embedded_default_serves_http_challenges() {
        let mut config = Config::default_embedded().unwrap();
        config.certificates.push(ManagedCertificateConfig {
            domains: vec!["example.com".to_string()],
            ..Default::default()
        });
        assert!(config.validate().is_ok());

        config.acme.webroot = None;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("no webroot"));
    }

    #[test]
    fn test_oversized_integers_rejected() {
        let err = Config::from_kdl("policy { max-retries 4294967296 }").unwrap_err();
        assert!(format!("{:#}", err).contains("max-retries"));

        let err = Config::from_kdl(r#"certificate "example.com" { renew-before-days 4294967296 }"#)
            .unwrap_err();
        assert!(format!("{:#}", err).contains("renew-before-days"));

        let err = Config::from_kdl("scheduler { pool-size -1 }").unwrap_err();
        assert!(format!("{:#}", err).contains("pool-size"));

        let config = Config::from_kdl("policy { max-retries 7 }").unwrap();
        assert_eq!(config.policy.max_retries, 7);
    }

    #[test]
    fn test_parse_error_is_reported() {
        let err = Config::from_kdl("acme { email \"unterminated }").unwrap_err();
        assert!(err.to_string().contains("Failed to parse KDL"));
    }

    #[test]
    fn test_policy_override() {
        let config = Config::default();
        let cert = ManagedCertificateConfig {
            domains: vec!["example.com".to_string()],
            renew_before_days: Some(14),
            max_retries: Some(2),
            ..Default::default()
        };

        let policy = config.policy_for(&cert);
        assert_eq!(policy.renew_before_expiry_secs, 14 * 86400);
        assert_eq!(policy.max_retries, 2);
    }
}
