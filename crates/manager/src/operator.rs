//! Operator commands.
//!
//! Everything the CLI can do to managed certificates goes through
//! [`Operator`], which maps results onto stable process exit codes.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use warden_common::{CertificateId, ChallengeKind, DomainSet, RenewalPolicy};
use warden_config::Config;

use crate::acme::leaf_validity;
use crate::errors::{ErrorKind, LifecycleError, StoreError};
use crate::hooks::HookReport;
use crate::orchestrator::{JobOutcome, Orchestrator};
use crate::record::{Attempt, CertificateRecord, CertificateState};
use crate::scheduler::RenewalScheduler;

/// Process exit codes
pub mod exit {
    pub const OK: u8 = 0;
    pub const ERROR: u8 = 1;
    pub const NOT_FOUND: u8 = 2;
    pub const CONFLICT: u8 = 3;
    pub const AUTHORITY: u8 = 4;
}

/// Operator command errors
#[derive(Debug, Error)]
pub enum OperatorError {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("Certificate '{id}' {outcome}")]
    Job { id: CertificateId, outcome: JobOutcome },

    #[error("{0}")]
    Invalid(String),
}

impl From<StoreError> for OperatorError {
    fn from(err: StoreError) -> Self {
        OperatorError::Lifecycle(err.into())
    }
}

impl OperatorError {
    pub fn exit_code(&self) -> u8 {
        match self {
            OperatorError::Lifecycle(LifecycleError::NotFound(_)) => exit::NOT_FOUND,
            OperatorError::Lifecycle(
                LifecycleError::Conflict(_)
                | LifecycleError::AlreadyRegistered(_)
                | LifecycleError::Store(StoreError::Locked(_)),
            ) => exit::CONFLICT,
            OperatorError::Lifecycle(e) => match e.kind() {
                Some(kind) if kind.is_authority_side() => exit::AUTHORITY,
                _ => exit::ERROR,
            },
            OperatorError::Job { outcome, .. } => match outcome {
                JobOutcome::Waiting { .. } => exit::AUTHORITY,
                other => match other.error_kind() {
                    Some(kind) if kind.is_authority_side() => exit::AUTHORITY,
                    _ => exit::ERROR,
                },
            },
            OperatorError::Invalid(_) => exit::ERROR,
        }
    }
}

/// Snapshot of one certificate for `status`
#[derive(Debug, Clone, Serialize)]
pub struct CertificateStatus {
    pub id: CertificateId,
    pub domains: Vec<String>,
    pub state: CertificateState,
    pub challenge: ChallengeKind,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    pub days_remaining: Option<i64>,
    pub failure_count: u32,
    pub max_retries: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_attempt: Option<Attempt>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub hooks: Vec<HookReport>,
    pub version: u64,
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.id)?;
        writeln!(f, "  domains:   {}", self.domains.join(", "))?;
        writeln!(f, "  state:     {}", self.state)?;
        writeln!(f, "  challenge: {}", self.challenge)?;
        if let Some(not_after) = self.not_after {
            write!(f, "  expires:   {}", not_after)?;
            match self.days_remaining {
                Some(days) if days < 0 => writeln!(f, " (expired)")?,
                Some(days) => writeln!(f, " ({} days)", days)?,
                None => writeln!(f)?,
            }
        }
        if let Some(path) = &self.cert_path {
            writeln!(f, "  cert:      {}", path.display())?;
        }
        if let Some(path) = &self.key_path {
            writeln!(f, "  key:       {}", path.display())?;
        }
        writeln!(f, "  failures:  {}/{}", self.failure_count, self.max_retries)?;
        if let Some(at) = self.next_attempt_at {
            writeln!(f, "  retry at:  {}", at)?;
        }
        if let Some(attempt) = &self.last_attempt {
            match &attempt.outcome {
                crate::record::AttemptOutcome::Succeeded => {
                    writeln!(f, "  last:      succeeded at {}", attempt.at)?
                }
                crate::record::AttemptOutcome::Failed { kind, message } => {
                    writeln!(f, "  last:      {} at {}: {}", kind, attempt.at, message)?
                }
            }
        }
        for report in &self.hooks {
            match (&report.error_kind, &report.message) {
                (None, _) => writeln!(
                    f,
                    "  hook {}: ok after {} attempt(s)",
                    report.hook, report.attempts
                )?,
                (Some(kind), message) => writeln!(
                    f,
                    "  hook {}: {} ({})",
                    report.hook,
                    kind,
                    message.as_deref().unwrap_or("")
                )?,
            }
        }
        Ok(())
    }
}

/// Result of registering declared certificates
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub registered: Vec<CertificateId>,
    /// Declared certificates whose stored domains differ from the config
    pub drifted: Vec<CertificateId>,
}

/// A stored certificate that needs attention
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactWarning {
    pub id: CertificateId,
    pub message: String,
}

/// Operator facade over the orchestrator and scheduler
#[derive(Debug, Clone)]
pub struct Operator {
    orchestrator: Arc<Orchestrator>,
    scheduler: Arc<RenewalScheduler>,
}

impl Operator {
    pub fn new(scheduler: Arc<RenewalScheduler>) -> Self {
        Self {
            orchestrator: scheduler.orchestrator().clone(),
            scheduler,
        }
    }

    pub fn register(
        &self,
        domains: DomainSet,
        policy: RenewalPolicy,
        challenge: ChallengeKind,
        hooks: Vec<String>,
    ) -> Result<CertificateStatus, OperatorError> {
        let record = self
            .orchestrator
            .register(domains, policy, challenge, hooks)?;
        Ok(self.describe(record))
    }

    pub fn status(&self, id: &CertificateId) -> Result<CertificateStatus, OperatorError> {
        let record = self
            .orchestrator
            .store()
            .get(id)?
            .ok_or_else(|| LifecycleError::NotFound(id.clone()))?;
        Ok(self.describe(record))
    }

    pub fn list(&self) -> Result<Vec<CertificateStatus>, OperatorError> {
        let records = self.orchestrator.store().list()?;
        Ok(records.into_iter().map(|r| self.describe(r)).collect())
    }

    /// Certificates parked in `Failed`, most recent failure first
    pub fn list_failed(&self) -> Result<Vec<CertificateStatus>, OperatorError> {
        let mut failed: Vec<CertificateRecord> = self
            .orchestrator
            .store()
            .list()?
            .into_iter()
            .filter(|r| r.state == CertificateState::Failed)
            .collect();
        failed.sort_by(|a, b| {
            let at = |r: &CertificateRecord| r.last_attempt.as_ref().map(|a| a.at);
            at(b).cmp(&at(a))
        });
        Ok(failed.into_iter().map(|r| self.describe(r)).collect())
    }

    /// Renew now, regardless of the renewal window
    pub async fn force_renew(
        &self,
        id: &CertificateId,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, OperatorError> {
        self.orchestrator.mark_renewal_due(id)?;
        let outcome = self.scheduler.run_now(id, cancel).await?;
        match outcome {
            JobOutcome::Issued { .. } | JobOutcome::Renewed { .. } | JobOutcome::Skipped(_) => {
                Ok(outcome)
            }
            other => Err(OperatorError::Job {
                id: id.clone(),
                outcome: other,
            }),
        }
    }

    /// Mark for renewal without running the job; the owning daemon renews
    /// it on its next check
    pub fn queue_renewal(&self, id: &CertificateId) -> Result<CertificateStatus, OperatorError> {
        Ok(self.describe(self.orchestrator.mark_renewal_due(id)?))
    }

    pub fn revoke(&self, id: &CertificateId) -> Result<CertificateStatus, OperatorError> {
        Ok(self.describe(self.orchestrator.revoke(id)?))
    }

    pub fn reset(&self, id: &CertificateId) -> Result<CertificateStatus, OperatorError> {
        Ok(self.describe(self.orchestrator.reset(id)?))
    }

    pub fn remove(&self, id: &CertificateId) -> Result<CertificateStatus, OperatorError> {
        Ok(self.describe(self.orchestrator.remove(id)?))
    }

    /// Register every certificate declared in configuration that is not
    /// stored yet
    pub fn reconcile(&self, config: &Config) -> Result<ReconcileReport, OperatorError> {
        let mut report = ReconcileReport::default();

        for declared in &config.certificates {
            let domains = DomainSet::validated(&declared.domains)
                .map_err(|e| OperatorError::Invalid(e.to_string()))?;
            let id = domains.certificate_id();

            match self.orchestrator.store().get(&id)? {
                Some(existing) => {
                    if existing.domains != domains {
                        warn!(
                            certificate_id = %id,
                            stored = %existing.domains,
                            declared = %domains,
                            "Declared domains differ from stored certificate; remove and re-register to apply"
                        );
                        report.drifted.push(id);
                    }
                }
                None => {
                    self.orchestrator.register(
                        domains,
                        config.policy_for(declared),
                        declared.challenge.unwrap_or(config.acme.challenge),
                        declared.hooks.clone(),
                    )?;
                    report.registered.push(id);
                }
            }
        }

        if !report.registered.is_empty() {
            info!(
                registered = report.registered.len(),
                "Registered certificates declared in configuration"
            );
        }
        Ok(report)
    }

    /// Inspect stored chains for expiry or corruption.
    ///
    /// Warns for servable certificates that expire within `within` or whose
    /// artifacts cannot be read or parsed.
    pub fn check_artifacts(&self, within: Duration) -> Result<Vec<ArtifactWarning>, OperatorError> {
        let now = self.orchestrator.clock().now();
        let store = self.orchestrator.store();
        let mut warnings = Vec::new();

        for record in store.list()? {
            let Some(artifacts) = record.servable_artifacts(now) else {
                continue;
            };
            let warning = |message: String| ArtifactWarning {
                id: record.id.clone(),
                message,
            };

            let loaded = match store.load_artifacts(&record.id, &artifacts) {
                Ok(loaded) => loaded,
                Err(e) => {
                    warnings.push(warning(e.to_string()));
                    continue;
                }
            };

            match leaf_validity(&loaded.chain_pem) {
                Ok((_, not_after)) if not_after <= now => {
                    warnings.push(warning(format!("certificate expired at {}", not_after)))
                }
                Ok((_, not_after)) if not_after - now <= within => warnings.push(warning(format!(
                    "certificate expires in {} days",
                    (not_after - now).num_days()
                ))),
                Ok(_) => {}
                Err(e) => warnings.push(warning(format!("stored chain is unusable: {}", e))),
            }
        }

        for w in &warnings {
            warn!(certificate_id = %w.id, warning = %w.message, "Stored certificate needs attention");
        }
        Ok(warnings)
    }

    fn describe(&self, record: CertificateRecord) -> CertificateStatus {
        let now = self.orchestrator.clock().now();
        let paths = record
            .servable_artifacts(now)
            .and_then(|a| self.orchestrator.store().artifact_path(&record.id, &a));
        let (cert_path, key_path) = match paths {
            Some((cert, key)) => (Some(cert), Some(key)),
            None => (None, None),
        };

        CertificateStatus {
            hooks: self.orchestrator.hooks().last_reports(&record.id),
            days_remaining: record.days_remaining(now),
            domains: record.domains.as_slice().to_vec(),
            max_retries: record.renewal_policy.max_retries,
            id: record.id,
            state: record.state,
            challenge: record.challenge,
            not_before: record.not_before,
            not_after: record.not_after,
            failure_count: record.failure_count,
            next_attempt_at: record.next_attempt_at,
            last_attempt: record.last_attempt,
            cert_path,
            key_path,
            version: record.version,
        }
    }
}

/// Error kind a failed command should be reported under, if any
pub fn error_kind(err: &OperatorError) -> Option<ErrorKind> {
    match err {
        OperatorError::Lifecycle(e) => e.kind(),
        OperatorError::Job { outcome, .. } => outcome.error_kind(),
        OperatorError::Invalid(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::{AcmeAdapter, AcmeError};
    use crate::hooks::HookRunner;
    use crate::record::CertificateMaterial;
    use crate::store::FsCertificateStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use rcgen::{CertificateParams, KeyPair};
    use warden_common::{Clock, ManualClock};

    /// Issues self-signed certificates valid for `validity` from the clock's now
    struct SelfSignedAdapter {
        clock: ManualClock,
        validity: Duration,
        next_error: Mutex<Option<AcmeError>>,
    }

    #[async_trait]
    impl AcmeAdapter for SelfSignedAdapter {
        async fn request_certificate(
            &self,
            domains: &DomainSet,
            _: ChallengeKind,
        ) -> Result<CertificateMaterial, AcmeError> {
            if let Some(err) = self.next_error.lock().take() {
                return Err(err);
            }
            let now = self.clock.now();
            let not_after = now + self.validity;
            let mut params = CertificateParams::new(domains.as_slice().to_vec()).unwrap();
            let epoch = rcgen::date_time_ymd(1970, 1, 1);
            params.not_before = epoch + std::time::Duration::from_secs(now.timestamp() as u64);
            params.not_after = epoch + std::time::Duration::from_secs(not_after.timestamp() as u64);
            let key = KeyPair::generate().unwrap();
            let cert = params.self_signed(&key).unwrap();
            let (not_before, not_after) = leaf_validity(&cert.pem()).unwrap();
            Ok(CertificateMaterial {
                chain_pem: cert.pem(),
                key_pem: key.serialize_pem(),
                not_before,
                not_after,
            })
        }
    }

    struct Setup {
        _dir: tempfile::TempDir,
        clock: ManualClock,
        adapter: Arc<SelfSignedAdapter>,
        operator: Operator,
    }

    fn setup() -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let start = DateTime::from_timestamp(Utc::now().timestamp(), 0).unwrap();
        let clock = ManualClock::new(start);
        let store = Arc::new(FsCertificateStore::open(dir.path()).unwrap());
        let adapter = Arc::new(SelfSignedAdapter {
            clock: clock.clone(),
            validity: Duration::days(90),
            next_error: Mutex::new(None),
        });
        let orchestrator = Arc::new(Orchestrator::new(
            store,
            adapter.clone(),
            HookRunner::new(Arc::new(clock.clone())),
            Arc::new(clock.clone()),
        ));
        let scheduler = Arc::new(RenewalScheduler::new(orchestrator));
        Setup {
            _dir: dir,
            clock,
            adapter,
            operator: Operator::new(scheduler),
        }
    }

    fn id() -> CertificateId {
        CertificateId::new("example.com")
    }

    fn register(s: &Setup) {
        s.operator
            .register(
                DomainSet::new(["example.com"]).unwrap(),
                RenewalPolicy::default(),
                ChallengeKind::Http01,
                Vec::new(),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_force_renew_and_status() {
        let s = setup();
        register(&s);

        let outcome = s
            .operator
            .force_renew(&id(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, JobOutcome::Issued { .. }));

        let status = s.operator.status(&id()).unwrap();
        assert_eq!(status.state, CertificateState::Active);
        assert_eq!(status.days_remaining, Some(90));
        assert!(status.cert_path.as_ref().unwrap().exists());
        assert!(status.to_string().contains("state:     active"));

        let outcome = s
            .operator
            .force_renew(&id(), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, JobOutcome::Renewed { .. }));
        assert_eq!(s.operator.status(&id()).unwrap().version, 6);
    }

    #[tokio::test]
    async fn test_queued_renewal_waits_for_daemon() {
        let s = setup();
        register(&s);
        s.operator
            .force_renew(&id(), &CancellationToken::new())
            .await
            .unwrap();

        let status = s.operator.queue_renewal(&id()).unwrap();
        assert_eq!(status.state, CertificateState::RenewalDue);
        assert!(status.cert_path.as_ref().unwrap().exists());

        let locked = OperatorError::Lifecycle(LifecycleError::Store(StoreError::Locked(
            std::path::PathBuf::from("/var/lib/warden/records/.owner.lock"),
        )));
        assert_eq!(locked.exit_code(), exit::CONFLICT);
    }

    #[tokio::test]
    async fn test_exit_codes() {
        let s = setup();
        let missing = s.operator.status(&CertificateId::new("missing.example.com"));
        assert_eq!(missing.unwrap_err().exit_code(), exit::NOT_FOUND);

        register(&s);
        let again = s.operator.register(
            DomainSet::new(["example.com"]).unwrap(),
            RenewalPolicy::default(),
            ChallengeKind::Http01,
            Vec::new(),
        );
        assert_eq!(again.unwrap_err().exit_code(), exit::CONFLICT);

        *s.adapter.next_error.lock() = Some(AcmeError::RateLimited {
            retry_after: std::time::Duration::from_secs(3600),
            detail: "slow down".to_string(),
        });
        let err = s
            .operator
            .force_renew(&id(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), exit::AUTHORITY);
        assert_eq!(error_kind(&err), Some(ErrorKind::RateLimited));

        // Still inside retry_after.
        let err = s
            .operator
            .force_renew(&id(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), exit::AUTHORITY);

        let err = s.operator.reset(&id()).unwrap_err();
        assert_eq!(err.exit_code(), exit::ERROR);
    }

    #[tokio::test]
    async fn test_list_failed_and_reset() {
        let s = setup();
        register(&s);
        *s.adapter.next_error.lock() = Some(AcmeError::ChallengeFailed {
            domain: "example.com".to_string(),
            detail: "404".to_string(),
        });
        let err = s
            .operator
            .force_renew(&id(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), exit::AUTHORITY);

        let failed = s.operator.list_failed().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].failure_count, 1);

        let status = s.operator.reset(&id()).unwrap();
        assert_eq!(status.state, CertificateState::Pending);
        assert!(s.operator.list_failed().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_check_artifacts_warns_near_expiry() {
        let s = setup();
        register(&s);
        s.operator
            .force_renew(&id(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(s.operator.check_artifacts(Duration::days(30)).unwrap().is_empty());

        s.clock.advance(Duration::days(80));
        let warnings = s.operator.check_artifacts(Duration::days(30)).unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].message.contains("expires in"));

        s.clock.advance(Duration::days(20));
        let warnings = s.operator.check_artifacts(Duration::days(30)).unwrap();
        assert!(warnings[0].message.contains("expired"));
    }

    #[test]
    fn test_reconcile_registers_declared_certificates() {
        let s = setup();
        let config = Config::from_kdl(
            r#"
            certificate "example.com" { domains "example.com" "www.example.com" }
            certificate "example.org" { domains "example.org" }
            "#,
        )
        .unwrap();

        let report = s.operator.reconcile(&config).unwrap();
        assert_eq!(report.registered.len(), 2);

        let report = s.operator.reconcile(&config).unwrap();
        assert!(report.registered.is_empty());
        assert!(report.drifted.is_empty());
        assert_eq!(s.operator.list().unwrap().len(), 2);

        s.operator.remove(&id()).unwrap();
        let narrowed = Config::from_kdl(
            r#"certificate "example.org" { domains "example.org" "www.example.org" }"#,
        )
        .unwrap();
        let report = s.operator.reconcile(&narrowed).unwrap();
        assert_eq!(report.drifted, vec![CertificateId::new("example.org")]);
    }
}
