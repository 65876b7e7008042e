//! Certificate records and the lifecycle state machine.
//!
//! ```text
//!   Pending ──request──▶ ChallengePending ──validated──▶ Issuing ──chain──▶ Active
//!      ▲                       │                            │                 │
//!      │                  challenge failed              error                window
//!      │                       ▼                            ▼                 ▼
//!      └──────reset────────  Failed  ◀──retries exhausted── Renewing ◀──── RenewalDue
//! ```
//!
//! Any state except `Revoked` may be revoked. `Renewing` falls back to
//! `Active` on a retryable failure and keeps the previous material.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use warden_common::{CertificateId, ChallengeKind, DomainSet, RenewalPolicy};

use crate::errors::{ErrorKind, LifecycleError};

// ============================================================================
// States and events
// ============================================================================

/// Lifecycle state of a managed certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateState {
    Pending,
    ChallengePending,
    Issuing,
    Active,
    RenewalDue,
    Renewing,
    Failed,
    Revoked,
}

impl CertificateState {
    /// States in which the stored material may be handed to consumers
    pub fn is_servable(&self) -> bool {
        matches!(
            self,
            CertificateState::Active | CertificateState::RenewalDue | CertificateState::Renewing
        )
    }

    /// States only held while a job owns the record
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            CertificateState::ChallengePending
                | CertificateState::Issuing
                | CertificateState::Renewing
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CertificateState::Pending => "pending",
            CertificateState::ChallengePending => "challenge_pending",
            CertificateState::Issuing => "issuing",
            CertificateState::Active => "active",
            CertificateState::RenewalDue => "renewal_due",
            CertificateState::Renewing => "renewing",
            CertificateState::Failed => "failed",
            CertificateState::Revoked => "revoked",
        }
    }

    pub const ALL: [CertificateState; 8] = [
        CertificateState::Pending,
        CertificateState::ChallengePending,
        CertificateState::Issuing,
        CertificateState::Active,
        CertificateState::RenewalDue,
        CertificateState::Renewing,
        CertificateState::Failed,
        CertificateState::Revoked,
    ];
}

impl fmt::Display for CertificateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A job starts the first issuance
    Request,
    /// The authority accepted every challenge
    Validated,
    /// A new chain was committed
    ChainReceived,
    /// The authority rejected validation or the names
    Rejected,
    /// Finalization failed after validation
    IssuanceError,
    /// A retryable failure before commit
    TransientFailure,
    /// The retry budget is spent
    RetriesExhausted,
    /// Remaining validity dropped into the renewal window
    WindowReached,
    /// A job starts a renewal
    BeginRenewal,
    /// Shutdown interrupted the job
    Cancelled,
    /// Backoff elapsed for a retryable failure
    Retry,
    /// Operator reset
    Reset,
    /// Operator revocation
    Revoke,
}

impl LifecycleEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::Request => "request",
            LifecycleEvent::Validated => "validate",
            LifecycleEvent::ChainReceived => "receive a chain",
            LifecycleEvent::Rejected => "be rejected",
            LifecycleEvent::IssuanceError => "fail issuance",
            LifecycleEvent::TransientFailure => "fail transiently",
            LifecycleEvent::RetriesExhausted => "exhaust retries",
            LifecycleEvent::WindowReached => "become due",
            LifecycleEvent::BeginRenewal => "renew",
            LifecycleEvent::Cancelled => "be cancelled",
            LifecycleEvent::Retry => "retry",
            LifecycleEvent::Reset => "reset",
            LifecycleEvent::Revoke => "revoke",
        }
    }
}

/// Pure transition function. `None` means the event is not legal in `from`.
pub fn transition(from: CertificateState, event: LifecycleEvent) -> Option<CertificateState> {
    use CertificateState::*;
    use LifecycleEvent::*;

    let to = match (from, event) {
        (Revoked, _) => return None,
        (_, Revoke) => Revoked,

        (Pending, Request) => ChallengePending,
        (ChallengePending, Validated) => Issuing,
        (ChallengePending, Rejected) => Failed,
        (Issuing, ChainReceived) => Active,
        (Issuing, IssuanceError) => Failed,
        (ChallengePending | Issuing, TransientFailure | Cancelled) => Pending,

        (Active, WindowReached) => RenewalDue,
        (Active | RenewalDue, BeginRenewal) => Renewing,
        (Renewing, ChainReceived) => Active,
        (Renewing, TransientFailure | IssuanceError | Cancelled) => Active,
        (Renewing, Rejected) => Failed,

        (ChallengePending | Issuing | Renewing, RetriesExhausted) => Failed,
        (Failed, Retry | Reset) => Pending,

        _ => return None,
    };
    Some(to)
}

// ============================================================================
// Attempts and artifacts
// ============================================================================

/// Result of the last issuance or renewal attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed { kind: ErrorKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
}

impl Attempt {
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.outcome {
            AttemptOutcome::Failed { kind, .. } => Some(*kind),
            AttemptOutcome::Succeeded => None,
        }
    }
}

/// Opaque reference to a persisted artifact, resolved by the store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key and chain references written together
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredArtifacts {
    pub private_key_ref: ArtifactRef,
    pub certificate_chain_ref: ArtifactRef,
}

/// Material returned by a successful order
#[derive(Clone)]
pub struct CertificateMaterial {
    pub chain_pem: String,
    pub key_pem: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("chain_len", &self.chain_pem.len())
            .field("key", &"<redacted>")
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish()
    }
}

// ============================================================================
// Record
// ============================================================================

/// Persisted state of one managed certificate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub id: CertificateId,
    pub domains: DomainSet,
    pub state: CertificateState,
    pub challenge: ChallengeKind,
    #[serde(default)]
    pub hooks: Vec<String>,
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub not_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub private_key_ref: Option<ArtifactRef>,
    #[serde(default)]
    pub certificate_chain_ref: Option<ArtifactRef>,
    #[serde(default)]
    pub last_attempt: Option<Attempt>,
    #[serde(default)]
    pub failure_count: u32,
    /// Earliest instant the scheduler may pick the record up again
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub renewal_policy: RenewalPolicy,
    /// Optimistic concurrency token, 0 for a record never stored
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CertificateRecord {
    /// New `Pending` record identified by the primary domain
    pub fn new(
        domains: DomainSet,
        renewal_policy: RenewalPolicy,
        challenge: ChallengeKind,
        hooks: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: domains.certificate_id(),
            domains,
            state: CertificateState::Pending,
            challenge,
            hooks,
            not_before: None,
            not_after: None,
            private_key_ref: None,
            certificate_chain_ref: None,
            last_attempt: None,
            failure_count: 0,
            next_attempt_at: None,
            renewal_policy,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a lifecycle event, rejecting illegal transitions
    pub fn apply(&mut self, event: LifecycleEvent) -> Result<CertificateState, LifecycleError> {
        let to = transition(self.state, event).ok_or_else(|| LifecycleError::InvalidTransition {
            id: self.id.clone(),
            from: self.state,
            event: event.as_str(),
        })?;
        self.state = to;
        Ok(to)
    }

    pub fn last_error_kind(&self) -> Option<ErrorKind> {
        self.last_attempt.as_ref().and_then(Attempt::error_kind)
    }

    pub fn backoff_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }

    /// Whether remaining validity is within the renewal window plus `horizon`.
    ///
    /// The boundary is inclusive.
    pub fn in_renewal_window(&self, now: DateTime<Utc>, horizon: Duration) -> bool {
        match self.not_after {
            Some(not_after) => {
                not_after - now <= self.renewal_policy.renew_before_expiry() + horizon
            }
            None => false,
        }
    }

    /// Whether the scheduler should submit a job for this record
    pub fn is_due(&self, now: DateTime<Utc>, horizon: Duration) -> bool {
        if !self.backoff_elapsed(now) {
            return false;
        }

        match self.state {
            CertificateState::Pending | CertificateState::RenewalDue => true,
            // Outside a running job these were left behind by a failed write
            CertificateState::ChallengePending
            | CertificateState::Issuing
            | CertificateState::Renewing => true,
            CertificateState::Active => self.in_renewal_window(now, horizon),
            CertificateState::Failed => {
                self.last_error_kind().is_some_and(|k| k.is_retryable())
                    && self.renewal_policy.retries_remain(self.failure_count)
            }
            _ => false,
        }
    }

    /// Both artifact references, if present
    pub fn artifacts(&self) -> Option<StoredArtifacts> {
        match (&self.private_key_ref, &self.certificate_chain_ref) {
            (Some(key), Some(chain)) => Some(StoredArtifacts {
                private_key_ref: key.clone(),
                certificate_chain_ref: chain.clone(),
            }),
            _ => None,
        }
    }

    /// Artifacts that may be handed to consumers at `now`.
    ///
    /// A record parked in `Failed` after a refused renewal keeps serving its
    /// last chain until that chain expires.
    pub fn servable_artifacts(&self, now: DateTime<Utc>) -> Option<StoredArtifacts> {
        let still_valid = self.not_after.is_some_and(|not_after| now < not_after);
        let parked_with_valid_chain = self.state == CertificateState::Failed
            && still_valid
            && self.last_error_kind() != Some(ErrorKind::ArtifactCorruption);

        if self.state.is_servable() || parked_with_valid_chain {
            self.artifacts()
        } else {
            None
        }
    }

    /// Whole days of validity left, negative once expired
    pub fn days_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        self.not_after.map(|not_after| (not_after - now).num_days())
    }

    /// Record committed material. Returns the artifacts it replaced.
    pub fn record_success(
        &mut self,
        now: DateTime<Utc>,
        material: &CertificateMaterial,
        artifacts: StoredArtifacts,
    ) -> Option<StoredArtifacts> {
        let previous = self.artifacts().filter(|prev| *prev != artifacts);

        self.not_before = Some(material.not_before);
        self.not_after = Some(material.not_after);
        self.private_key_ref = Some(artifacts.private_key_ref);
        self.certificate_chain_ref = Some(artifacts.certificate_chain_ref);
        self.failure_count = 0;
        self.next_attempt_at = None;
        self.last_attempt = Some(Attempt {
            at: now,
            outcome: AttemptOutcome::Succeeded,
        });
        previous
    }

    /// Record a failed attempt and schedule the next one.
    ///
    /// Retryable kinds wait for the larger of the policy backoff and
    /// `retry_after`. Other kinds are never retried automatically.
    pub fn record_failure(
        &mut self,
        now: DateTime<Utc>,
        kind: ErrorKind,
        message: impl Into<String>,
        retry_after: Option<Duration>,
    ) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_attempt = Some(Attempt {
            at: now,
            outcome: AttemptOutcome::Failed {
                kind,
                message: message.into(),
            },
        });

        self.next_attempt_at = if kind.is_retryable() {
            let backoff = self
                .renewal_policy
                .retry_backoff
                .delay_for(self.failure_count);
            let wait = retry_after.map_or(backoff, |ra| ra.max(backoff));
            Some(now + wait)
        } else {
            None
        };
    }

    /// Clear failure bookkeeping after an operator reset
    pub fn clear_failures(&mut self) {
        self.failure_count = 0;
        self.next_attempt_at = None;
    }
}
