//! Shared policy and lifecycle types.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Span of `secs` seconds, saturating at [`Duration::MAX`] for values chrono
/// cannot represent
pub fn span_from_secs(secs: u64) -> Duration {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

// ============================================================================
// Renewal Policy
// ============================================================================

/// Per-certificate renewal policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewalPolicy {
    /// Renew once the remaining validity is at or below this many seconds
    #[serde(default = "default_renew_before_expiry_secs")]
    pub renew_before_expiry_secs: u64,

    /// Consecutive failures tolerated before the record is parked in `Failed`
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay schedule between automatic retries
    #[serde(default)]
    pub retry_backoff: BackoffSchedule,
}

fn default_renew_before_expiry_secs() -> u64 {
    30 * 86400
}

fn default_max_retries() -> u32 {
    5
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self {
            renew_before_expiry_secs: default_renew_before_expiry_secs(),
            max_retries: default_max_retries(),
            retry_backoff: BackoffSchedule::default(),
        }
    }
}

impl RenewalPolicy {
    /// Renewal window as a duration
    pub fn renew_before_expiry(&self) -> Duration {
        span_from_secs(self.renew_before_expiry_secs)
    }

    /// Convenience constructor for a window expressed in days
    pub fn with_renew_before_days(mut self, days: u32) -> Self {
        self.renew_before_expiry_secs = u64::from(days) * 86400;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Whether another automatic attempt is allowed after `failures`
    /// consecutive failures
    pub fn retries_remain(&self, failures: u32) -> bool {
        failures < self.max_retries
    }
}

// ============================================================================
// Backoff
// ============================================================================

/// Exponential backoff schedule.
///
/// The delay after the `n`th consecutive failure is
/// `base * multiplier^(n-1)`, capped at `max`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffSchedule {
    /// Delay after the first failure
    #[serde(default = "default_backoff_base_secs")]
    pub base_secs: u64,

    /// Upper bound for any single delay
    #[serde(default = "default_backoff_max_secs")]
    pub max_secs: u64,

    /// Growth factor between consecutive delays
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: u32,
}

fn default_backoff_base_secs() -> u64 {
    300
}

fn default_backoff_max_secs() -> u64 {
    86400
}

fn default_backoff_multiplier() -> u32 {
    2
}

impl Default for BackoffSchedule {
    fn default() -> Self {
        Self {
            base_secs: default_backoff_base_secs(),
            max_secs: default_backoff_max_secs(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

impl BackoffSchedule {
    /// Delay to wait after `failures` consecutive failures.
    ///
    /// Zero failures yields no delay.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::zero();
        }

        let factor = u64::from(self.multiplier.max(1))
            .checked_pow(failures - 1)
            .unwrap_or(u64::MAX);
        span_from_secs(self.base_secs.saturating_mul(factor).min(self.max_secs))
    }
}

// ============================================================================
// Challenge Type
// ============================================================================

/// ACME challenge used to prove control of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ChallengeKind {
    /// Token file served at `/.well-known/acme-challenge/<token>`
    #[default]
    Http01,
    /// TXT record at `_acme-challenge.<domain>`
    Dns01,
}

impl ChallengeKind {
    /// Parse the configuration spelling (`http-01`, `dns-01`)
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "http-01" | "http01" | "http" => Some(Self::Http01),
            "dns-01" | "dns01" | "dns" => Some(Self::Dns01),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http01 => "http-01",
            Self::Dns01 => "dns-01",
        }
    }
}

impl fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_growth_and_cap() {
        let schedule = BackoffSchedule {
            base_secs: 60,
            max_secs: 600,
            multiplier: 2,
        };

        assert_eq!(schedule.delay_for(0), Duration::zero());
        assert_eq!(schedule.delay_for(1), Duration::seconds(60));
        assert_eq!(schedule.delay_for(2), Duration::seconds(120));
        assert_eq!(schedule.delay_for(4), Duration::seconds(480));
        assert_eq!(schedule.delay_for(5), Duration::seconds(600));
        assert_eq!(schedule.delay_for(64), Duration::seconds(600));
    }

    #[test]
    fn test_unbounded_schedule_saturates() {
        let schedule = BackoffSchedule {
            base_secs: u64::MAX / 2,
            max_secs: u64::MAX,
            multiplier: 10,
        };
        assert_eq!(schedule.delay_for(1), Duration::MAX);
        assert_eq!(schedule.delay_for(40), Duration::MAX);

        let policy = RenewalPolicy {
            renew_before_expiry_secs: u64::MAX,
            ..RenewalPolicy::default()
        };
        assert_eq!(policy.renew_before_expiry(), Duration::MAX);
        assert_eq!(span_from_secs(90), Duration::seconds(90));
    }

    #[test]
    fn test_policy_retries_remain() {
        let policy = RenewalPolicy::default().with_max_retries(3);
        assert!(policy.retries_remain(2));
        assert!(!policy.retries_remain(3));
    }

    #[test]
    fn test_policy_window_days() {
        let policy = RenewalPolicy::default().with_renew_before_days(30);
        assert_eq!(policy.renew_before_expiry(), Duration::days(30));
    }

    #[test]
    fn test_challenge_kind_parse() {
        assert_eq!(ChallengeKind::from_str_loose("HTTP-01"), Some(ChallengeKind::Http01));
        assert_eq!(ChallengeKind::from_str_loose("dns_01"), Some(ChallengeKind::Dns01));
        assert_eq!(ChallengeKind::from_str_loose("tls-alpn-01"), None);
        assert_eq!(ChallengeKind::Dns01.to_string(), "dns-01");
    }
}
