//! Lifecycle orchestrator.
//!
//! Drives one certificate at a time through
//! request -> challenge -> issuance -> installation -> renewal. The
//! orchestrator is the only component that mutates records; every mutation
//! is a read-modify-write against the store's version check.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use warden_common::{
    validate_domain, CertificateId, ChallengeKind, Clock, DomainError, DomainSet, RenewalPolicy,
};

use crate::acme::{AcmeAdapter, AcmeError};
use crate::errors::{ErrorKind, LifecycleError, StoreError};
use crate::hooks::{HookContext, HookRunner, HookSpec};
use crate::metrics::Metrics;
use crate::record::{
    CertificateMaterial, CertificateRecord, CertificateState, LifecycleEvent, StoredArtifacts,
};
use crate::store::CertificateStore;

/// Result of one orchestrator job
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// First certificate committed
    Issued { not_after: DateTime<Utc> },
    /// Replacement certificate committed, previous one retired
    Renewed { not_after: DateTime<Utc> },
    /// Transient failure; the record kept its stable state
    Deferred {
        kind: ErrorKind,
        message: String,
        until: Option<DateTime<Utc>>,
    },
    /// Backoff from an earlier failure has not elapsed
    Waiting { until: DateTime<Utc> },
    /// The record moved to `Failed`
    Failed { kind: ErrorKind, message: String },
    /// Nothing to do in the current state
    Skipped(&'static str),
    /// Shutdown interrupted the job; the pre-job state was restored
    Cancelled,
}

impl JobOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            JobOutcome::Issued { .. } => "issued",
            JobOutcome::Renewed { .. } => "renewed",
            JobOutcome::Deferred { .. } => "deferred",
            JobOutcome::Waiting { .. } => "waiting",
            JobOutcome::Failed { .. } => "failed",
            JobOutcome::Skipped(_) => "skipped",
            JobOutcome::Cancelled => "cancelled",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Issued { .. } | JobOutcome::Renewed { .. })
    }

    /// Error kind of a failed or deferred attempt
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            JobOutcome::Deferred { kind, .. } | JobOutcome::Failed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Issued { not_after } => write!(f, "issued, valid until {}", not_after),
            JobOutcome::Renewed { not_after } => write!(f, "renewed, valid until {}", not_after),
            JobOutcome::Deferred {
                kind,
                message,
                until,
            } => match until {
                Some(until) => write!(f, "deferred until {} ({}: {})", until, kind, message),
                None => write!(f, "deferred ({}: {})", kind, message),
            },
            JobOutcome::Waiting { until } => write!(f, "waiting for backoff until {}", until),
            JobOutcome::Failed { kind, message } => write!(f, "failed ({}: {})", kind, message),
            JobOutcome::Skipped(reason) => write!(f, "skipped: {}", reason),
            JobOutcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Drives certificates through their lifecycle
pub struct Orchestrator {
    store: Arc<dyn CertificateStore>,
    acme: Arc<dyn AcmeAdapter>,
    hooks: HookRunner,
    hook_specs: BTreeMap<String, HookSpec>,
    clock: Arc<dyn Clock>,
    metrics: Option<Metrics>,
    horizon: Duration,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn CertificateStore>,
        acme: Arc<dyn AcmeAdapter>,
        hooks: HookRunner,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            acme,
            hooks,
            hook_specs: BTreeMap::new(),
            clock,
            metrics: None,
            horizon: Duration::zero(),
        }
    }

    pub fn with_hook_specs(mut self, specs: impl IntoIterator<Item = HookSpec>) -> Self {
        self.hook_specs = specs.into_iter().map(|s| (s.name.clone(), s)).collect();
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Extra look-ahead added to every renewal window
    pub fn with_horizon(mut self, horizon: Duration) -> Self {
        self.horizon = horizon;
        self
    }

    pub fn store(&self) -> &Arc<dyn CertificateStore> {
        &self.store
    }

    pub fn hooks(&self) -> &HookRunner {
        &self.hooks
    }

    /// Wait for challenge cleanup and dispatched hooks, each bounded by `grace`
    pub async fn drain(&self, grace: std::time::Duration) -> bool {
        let challenges = self.acme.drain(grace).await;
        let hooks = self.hooks.drain(grace).await;
        challenges && hooks
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn horizon(&self) -> Duration {
        self.horizon
    }

    pub fn has_hook(&self, name: &str) -> bool {
        self.hook_specs.contains_key(name)
    }

    // ------------------------------------------------------------------------
    // Operator actions
    // ------------------------------------------------------------------------

    /// Create a `Pending` record for a new domain set
    pub fn register(
        &self,
        domains: DomainSet,
        policy: RenewalPolicy,
        challenge: ChallengeKind,
        hooks: Vec<String>,
    ) -> Result<CertificateRecord, LifecycleError> {
        for domain in domains.iter() {
            validate_domain(domain)?;
            if challenge == ChallengeKind::Http01 && domain.starts_with("*.") {
                return Err(DomainError::Invalid {
                    domain: domain.to_string(),
                    reason: "wildcard names require the dns-01 challenge",
                }
                .into());
            }
        }
        if let Some(unknown) = hooks.iter().find(|h| !self.has_hook(h)) {
            return Err(LifecycleError::UnknownHook(unknown.clone()));
        }

        let id = domains.certificate_id();
        if self.store.get(&id)?.is_some() {
            return Err(LifecycleError::AlreadyRegistered(id));
        }

        let record = CertificateRecord::new(domains, policy, challenge, hooks, self.clock.now());
        let stored = self.store.upsert(record)?;
        info!(
            certificate_id = %stored.id,
            domains = %stored.domains,
            challenge = %stored.challenge,
            "Registered certificate"
        );
        Ok(stored)
    }

    /// Move an `Active` record into `RenewalDue` so the next job renews it
    pub fn mark_renewal_due(&self, id: &CertificateId) -> Result<CertificateRecord, LifecycleError> {
        let record = self.load(id)?;
        match record.state {
            CertificateState::RenewalDue | CertificateState::Pending => Ok(record),
            _ => {
                let updated = self.update(&record, |r| r.apply(LifecycleEvent::WindowReached).map(drop))?;
                info!(certificate_id = %id, "Certificate marked for renewal");
                Ok(updated)
            }
        }
    }

    /// Move a `Failed` record back to `Pending` with a fresh retry budget
    pub fn reset(&self, id: &CertificateId) -> Result<CertificateRecord, LifecycleError> {
        let record = self.load(id)?;
        let updated = self.update(&record, |r| {
            r.apply(LifecycleEvent::Reset)?;
            r.clear_failures();
            Ok(())
        })?;
        info!(certificate_id = %id, "Certificate reset to pending");
        Ok(updated)
    }

    /// Mark a record `Revoked`. Terminal.
    pub fn revoke(&self, id: &CertificateId) -> Result<CertificateRecord, LifecycleError> {
        let record = self.load(id)?;
        let updated = self.update(&record, |r| {
            r.apply(LifecycleEvent::Revoke)?;
            r.next_attempt_at = None;
            Ok(())
        })?;
        warn!(certificate_id = %id, previous_state = %record.state, "Certificate revoked");
        Ok(updated)
    }

    /// Delete a record together with its artifacts
    pub fn remove(&self, id: &CertificateId) -> Result<CertificateRecord, LifecycleError> {
        let removed = self.store.delete(id)?;
        self.hooks.forget(id);
        info!(certificate_id = %id, state = %removed.state, "Certificate removed");
        Ok(removed)
    }

    // ------------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------------

    /// Run whatever the record's current state calls for.
    ///
    /// Returns `Err` only when the store or a state transition fails; ACME
    /// failures are recorded on the record and reported as the outcome.
    ///
    /// Callers hold the certificate's job lock, so an in-flight state seen
    /// here was left behind by an earlier job and is released first.
    pub async fn process(
        &self,
        id: &CertificateId,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, LifecycleError> {
        let mut record = self.load(id)?;
        let now = self.clock.now();

        if record.state.is_in_flight() {
            let stale = record.state;
            record = self.update(&record, |r| r.apply(LifecycleEvent::Cancelled).map(drop))?;
            warn!(
                certificate_id = %id,
                from = %stale,
                to = %record.state,
                "Released record left in flight by an earlier job"
            );
        }

        if let Some(until) = record.next_attempt_at.filter(|at| *at > now) {
            debug!(certificate_id = %id, until = %until, "Backoff not elapsed");
            return Ok(JobOutcome::Waiting { until });
        }

        let outcome = match record.state {
            CertificateState::Pending => self.issue(record, cancel).await?,
            CertificateState::Failed if self.retry_allowed(&record) => {
                let record = self.update(&record, |r| r.apply(LifecycleEvent::Retry).map(drop))?;
                self.issue(record, cancel).await?
            }
            CertificateState::RenewalDue => {
                self.renew(record, CertificateState::RenewalDue, cancel).await?
            }
            CertificateState::Active if record.in_renewal_window(now, self.horizon) => {
                self.renew(record, CertificateState::Active, cancel).await?
            }
            CertificateState::Active => JobOutcome::Skipped("not in renewal window"),
            CertificateState::Failed => JobOutcome::Skipped("failed, waiting for reset"),
            CertificateState::Revoked => JobOutcome::Skipped("revoked"),
            CertificateState::ChallengePending
            | CertificateState::Issuing
            | CertificateState::Renewing => JobOutcome::Skipped("job already in flight"),
        };

        if let Some(metrics) = &self.metrics {
            if !matches!(outcome, JobOutcome::Skipped(_) | JobOutcome::Waiting { .. }) {
                metrics.issuance(outcome.label());
            }
        }
        Ok(outcome)
    }

    fn retry_allowed(&self, record: &CertificateRecord) -> bool {
        record.last_error_kind().is_some_and(|k| k.is_retryable())
            && record.renewal_policy.retries_remain(record.failure_count)
    }

    async fn issue(
        &self,
        record: CertificateRecord,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, LifecycleError> {
        let record = self.update(&record, |r| r.apply(LifecycleEvent::Request).map(drop))?;
        info!(
            certificate_id = %record.id,
            domains = %record.domains,
            challenge = %record.challenge,
            "Requesting certificate"
        );

        let settled = match self.request(&record, cancel).await {
            None => self.cancelled(&record, CertificateState::Pending),
            Some(Ok(material)) => self.commit(&record, material, false),
            Some(Err(e)) => self.fail(&record, e, CertificateState::Pending),
        };
        settled.or_else(|e| self.abandon(&record.id, CertificateState::Pending, e))
    }

    async fn renew(
        &self,
        record: CertificateRecord,
        origin: CertificateState,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, LifecycleError> {
        let record = self.update(&record, |r| r.apply(LifecycleEvent::BeginRenewal).map(drop))?;
        info!(
            certificate_id = %record.id,
            not_after = ?record.not_after,
            "Renewing certificate"
        );

        let settled = match self.request(&record, cancel).await {
            None => self.cancelled(&record, origin),
            Some(Ok(material)) => self.commit(&record, material, true),
            Some(Err(e)) => self.fail(&record, e, origin),
        };
        settled.or_else(|e| self.abandon(&record.id, origin, e))
    }

    /// ACME round trip, or `None` when cancelled first
    async fn request(
        &self,
        record: &CertificateRecord,
        cancel: &CancellationToken,
    ) -> Option<Result<CertificateMaterial, AcmeError>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = self.acme.request_certificate(&record.domains, record.challenge) => Some(result),
        }
    }

    /// Persist new material, then flip the record to `Active`
    fn commit(
        &self,
        record: &CertificateRecord,
        material: CertificateMaterial,
        renewal: bool,
    ) -> Result<JobOutcome, LifecycleError> {
        let id = &record.id;
        let artifacts = self.store.store_artifacts(id, &material)?;
        let now = self.clock.now();

        let mut retired = None;
        let committed = self.update(record, |r| {
            if r.state == CertificateState::ChallengePending {
                r.apply(LifecycleEvent::Validated)?;
            }
            r.apply(LifecycleEvent::ChainReceived)?;
            retired = r.record_success(now, &material, artifacts.clone());
            Ok(())
        });

        let committed = match committed {
            Ok(committed) => committed,
            Err(e) => {
                self.discard(id, &artifacts);
                return Err(e);
            }
        };

        if let Some(old) = retired {
            self.discard(id, &old);
        }

        info!(
            certificate_id = %id,
            not_after = %material.not_after,
            renewal,
            "Certificate installed"
        );
        self.dispatch_hooks(&committed, &artifacts);

        Ok(if renewal {
            JobOutcome::Renewed {
                not_after: material.not_after,
            }
        } else {
            JobOutcome::Issued {
                not_after: material.not_after,
            }
        })
    }

    /// Record a failed attempt and pick the follow-up state
    fn fail(
        &self,
        record: &CertificateRecord,
        err: AcmeError,
        origin: CertificateState,
    ) -> Result<JobOutcome, LifecycleError> {
        let kind = err.kind();
        let message = err.to_string();
        let retry_after = err
            .retry_after()
            .and_then(|d| Duration::from_std(d).ok());
        let now = self.clock.now();

        let stored = self.update(record, |r| {
            r.record_failure(now, kind, message.clone(), retry_after);

            let event = if matches!(kind, ErrorKind::ChallengeFailed | ErrorKind::InvalidDomain) {
                LifecycleEvent::Rejected
            } else if !r.renewal_policy.retries_remain(r.failure_count) {
                LifecycleEvent::RetriesExhausted
            } else if kind == ErrorKind::IssuanceFailed {
                if r.state == CertificateState::ChallengePending {
                    r.apply(LifecycleEvent::Validated)?;
                }
                LifecycleEvent::IssuanceError
            } else {
                LifecycleEvent::TransientFailure
            };
            r.apply(event)?;
            restore_origin(r, origin)
        })?;

        if stored.state == CertificateState::Failed {
            error!(
                certificate_id = %stored.id,
                error_kind = %kind,
                failure_count = stored.failure_count,
                error = %message,
                "Certificate request failed"
            );
            Ok(JobOutcome::Failed { kind, message })
        } else {
            warn!(
                certificate_id = %stored.id,
                state = %stored.state,
                error_kind = %kind,
                failure_count = stored.failure_count,
                next_attempt_at = ?stored.next_attempt_at,
                error = %message,
                "Certificate request deferred"
            );
            Ok(JobOutcome::Deferred {
                kind,
                message,
                until: stored.next_attempt_at,
            })
        }
    }

    /// Settle a job whose own bookkeeping failed after the record went in
    /// flight, so it is never left in `ChallengePending`, `Issuing` or
    /// `Renewing`.
    ///
    /// The store failure is recorded like an issuance failure. Kinds that
    /// cannot be retried park the record in `Failed`.
    fn abandon(
        &self,
        id: &CertificateId,
        origin: CertificateState,
        err: LifecycleError,
    ) -> Result<JobOutcome, LifecycleError> {
        let current = match self.store.get(id) {
            Ok(Some(current)) if current.state.is_in_flight() => current,
            _ => return Err(err),
        };

        let kind = err.kind().unwrap_or(ErrorKind::IssuanceFailed);
        let message = err.to_string();
        let now = self.clock.now();

        let settled = self.update(&current, |r| {
            r.record_failure(now, kind, message.clone(), None);
            let event = if kind.is_retryable() && r.renewal_policy.retries_remain(r.failure_count) {
                LifecycleEvent::TransientFailure
            } else {
                LifecycleEvent::RetriesExhausted
            };
            r.apply(event)?;
            restore_origin(r, origin)
        });

        match settled {
            Ok(stored) => {
                error!(
                    certificate_id = %id,
                    state = %stored.state,
                    error_kind = %kind,
                    error = %message,
                    "Job failed after the record went in flight"
                );
                Ok(if stored.state == CertificateState::Failed {
                    JobOutcome::Failed { kind, message }
                } else {
                    JobOutcome::Deferred {
                        kind,
                        message,
                        until: stored.next_attempt_at,
                    }
                })
            }
            Err(e) => {
                error!(
                    certificate_id = %id,
                    error = %e,
                    "Failed to release in-flight record"
                );
                Err(err)
            }
        }
    }

    fn cancelled(
        &self,
        record: &CertificateRecord,
        origin: CertificateState,
    ) -> Result<JobOutcome, LifecycleError> {
        let restored = self.update(record, |r| {
            r.apply(LifecycleEvent::Cancelled)?;
            restore_origin(r, origin)
        })?;
        info!(certificate_id = %record.id, state = %restored.state, "Job cancelled");
        Ok(JobOutcome::Cancelled)
    }

    fn dispatch_hooks(&self, record: &CertificateRecord, artifacts: &StoredArtifacts) {
        let specs: Vec<HookSpec> = record
            .hooks
            .iter()
            .filter_map(|name| match self.hook_specs.get(name) {
                Some(spec) => Some(spec.clone()),
                None => {
                    warn!(certificate_id = %record.id, hook = %name, "Hook is not configured, skipping");
                    None
                }
            })
            .collect();

        let (cert_path, key_path) = match self.store.artifact_path(&record.id, artifacts) {
            Some((cert, key)) => (Some(cert), Some(key)),
            None => (None, None),
        };

        self.hooks.dispatch(
            HookContext {
                id: record.id.clone(),
                domains: record.domains.clone(),
                cert_path,
                key_path,
                not_after: record.not_after,
            },
            specs,
        );
    }

    fn discard(&self, id: &CertificateId, artifacts: &StoredArtifacts) {
        if let Err(e) = self.store.discard_artifacts(id, artifacts) {
            warn!(certificate_id = %id, error = %e, "Failed to discard artifacts");
        }
    }

    // ------------------------------------------------------------------------
    // Store access
    // ------------------------------------------------------------------------

    fn load(&self, id: &CertificateId) -> Result<CertificateRecord, LifecycleError> {
        self.store
            .get(id)?
            .ok_or_else(|| LifecycleError::NotFound(id.clone()))
    }

    /// Apply `mutate` to `current` and store it.
    ///
    /// On a version conflict the record is re-read and `mutate` applied once
    /// more; a second conflict is returned to the caller.
    fn update<F>(
        &self,
        current: &CertificateRecord,
        mut mutate: F,
    ) -> Result<CertificateRecord, LifecycleError>
    where
        F: FnMut(&mut CertificateRecord) -> Result<(), LifecycleError>,
    {
        let from = current.state;
        let mut next = current.clone();
        mutate(&mut next)?;
        next.updated_at = self.clock.now();

        let stored = match self.store.upsert(next) {
            Ok(stored) => stored,
            Err(StoreError::Conflict { .. }) => {
                debug!(certificate_id = %current.id, "Version conflict, re-reading record");
                let mut fresh = self.load(&current.id)?;
                mutate(&mut fresh)?;
                fresh.updated_at = self.clock.now();
                self.store.upsert(fresh)?
            }
            Err(e) => return Err(e.into()),
        };

        if stored.state != from {
            debug!(
                certificate_id = %stored.id,
                from = %from,
                to = %stored.state,
                version = stored.version,
                "State transition"
            );
        }
        Ok(stored)
    }
}

/// After a renewal reverts to `Active`, put a forced renewal back in `RenewalDue`
fn restore_origin(
    record: &mut CertificateRecord,
    origin: CertificateState,
) -> Result<(), LifecycleError> {
    if origin == CertificateState::RenewalDue && record.state == CertificateState::Active {
        record.apply(LifecycleEvent::WindowReached)?;
    }
    Ok(())
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("store", &self.store)
            .field("hooks", &self.hook_specs.keys().collect::<Vec<_>>())
            .field("horizon", &self.horizon)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCertificateStore;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration as StdDuration;
    use warden_common::ManualClock;

    /// Adapter replaying scripted results; issues 90 day certificates by default
    struct ScriptedAdapter {
        clock: ManualClock,
        script: Mutex<VecDeque<Result<(), AcmeError>>>,
        calls: Mutex<u32>,
        stall: bool,
    }

    impl ScriptedAdapter {
        fn new(clock: ManualClock) -> Self {
            Self {
                clock,
                script: Mutex::new(VecDeque::new()),
                calls: Mutex::new(0),
                stall: false,
            }
        }

        fn then_fail(&self, err: AcmeError) {
            self.script.lock().push_back(Err(err));
        }

        fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl AcmeAdapter for ScriptedAdapter {
        async fn request_certificate(
            &self,
            domains: &DomainSet,
            _: ChallengeKind,
        ) -> Result<CertificateMaterial, AcmeError> {
            *self.calls.lock() += 1;
            if self.stall {
                std::future::pending::<()>().await;
            }
            self.script.lock().pop_front().unwrap_or(Ok(()))?;

            let now = self.clock.now();
            let serial = self.calls();
            Ok(CertificateMaterial {
                chain_pem: format!("CHAIN {} #{}", domains, serial),
                key_pem: format!("KEY #{}", serial),
                not_before: now,
                not_after: now + Duration::days(90),
            })
        }
    }

    struct Harness {
        clock: ManualClock,
        store: Arc<MemoryCertificateStore>,
        adapter: Arc<ScriptedAdapter>,
        orchestrator: Orchestrator,
    }

    fn harness_with(adapter: impl FnOnce(ManualClock) -> ScriptedAdapter) -> Harness {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        let store = Arc::new(MemoryCertificateStore::new());
        let adapter = Arc::new(adapter(clock.clone()));
        let hooks = HookRunner::new(Arc::new(clock.clone()))
            .with_retry_base(StdDuration::from_millis(1));
        let orchestrator = Orchestrator::new(
            store.clone(),
            adapter.clone(),
            hooks,
            Arc::new(clock.clone()),
        )
        .with_hook_specs([HookSpec {
            name: "noop".to_string(),
            command: "true".to_string(),
            timeout: StdDuration::from_secs(5),
            retries: 0,
        }]);

        Harness {
            clock,
            store,
            adapter,
            orchestrator,
        }
    }

    fn harness() -> Harness {
        harness_with(ScriptedAdapter::new)
    }

    fn id() -> CertificateId {
        CertificateId::new("example.com")
    }

    fn register(h: &Harness, max_retries: u32) -> CertificateRecord {
        h.orchestrator
            .register(
                DomainSet::new(["example.com", "www.example.com"]).unwrap(),
                RenewalPolicy::default()
                    .with_renew_before_days(30)
                    .with_max_retries(max_retries),
                ChallengeKind::Http01,
                vec!["noop".to_string()],
            )
            .unwrap()
    }

    async fn run(h: &Harness) -> JobOutcome {
        h.orchestrator
            .process(&id(), &CancellationToken::new())
            .await
            .unwrap()
    }

    fn get(h: &Harness) -> CertificateRecord {
        h.store.get(&id()).unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_first_issuance() {
        let h = harness();
        register(&h, 5);

        let outcome = run(&h).await;
        let record = get(&h);

        assert_eq!(
            outcome,
            JobOutcome::Issued {
                not_after: h.clock.now() + Duration::days(90)
            }
        );
        assert_eq!(record.state, CertificateState::Active);
        assert!(record.servable_artifacts(h.clock.now()).is_some());
        assert_eq!(record.failure_count, 0);
        assert!(h.orchestrator.hooks().drain(StdDuration::from_secs(5)).await);
        assert!(h.orchestrator.hooks().last_reports(&id())[0].succeeded());
    }

    #[tokio::test]
    async fn test_renewal_retires_previous_artifacts() {
        let h = harness();
        register(&h, 5);
        run(&h).await;
        let first = get(&h).artifacts().unwrap();

        assert_eq!(run(&h).await, JobOutcome::Skipped("not in renewal window"));

        h.clock.advance(Duration::days(61));
        let outcome = run(&h).await;
        let record = get(&h);

        assert!(matches!(outcome, JobOutcome::Renewed { .. }));
        assert_eq!(record.not_after, Some(h.clock.now() + Duration::days(90)));
        assert_ne!(record.artifacts().unwrap(), first);
        assert!(h.store.load_artifacts(&id(), &first).is_err());
        assert_eq!(h.store.artifact_count(), 2);
        assert_eq!(h.store.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_challenge_failure_parks_record() {
        let h = harness();
        register(&h, 5);
        h.adapter.then_fail(AcmeError::ChallengeFailed {
            domain: "www.example.com".to_string(),
            detail: "connection refused".to_string(),
        });

        let outcome = run(&h).await;
        let record = get(&h);

        assert_eq!(outcome.error_kind(), Some(ErrorKind::ChallengeFailed));
        assert_eq!(record.state, CertificateState::Failed);
        assert_eq!(record.failure_count, 1);
        assert!(!record.is_due(h.clock.now() + Duration::days(30), Duration::zero()));

        h.clock.advance(Duration::days(1));
        assert_eq!(run(&h).await, JobOutcome::Skipped("failed, waiting for reset"));
        assert_eq!(h.adapter.calls(), 1);

        h.orchestrator.reset(&id()).unwrap();
        assert!(run(&h).await.is_success());
    }

    #[tokio::test]
    async fn test_rate_limit_defers_in_pending() {
        let h = harness();
        register(&h, 5);
        h.adapter.then_fail(AcmeError::RateLimited {
            retry_after: StdDuration::from_secs(3600),
            detail: "too many orders".to_string(),
        });

        let outcome = run(&h).await;
        let record = get(&h);
        let until = h.clock.now() + Duration::hours(1);

        assert!(matches!(outcome, JobOutcome::Deferred { kind: ErrorKind::RateLimited, until: Some(u), .. } if u == until));
        assert_eq!(record.state, CertificateState::Pending);
        assert_eq!(record.next_attempt_at, Some(until));

        h.clock.advance(Duration::minutes(59));
        assert_eq!(run(&h).await, JobOutcome::Waiting { until });
        assert_eq!(h.adapter.calls(), 1);

        h.clock.advance(Duration::minutes(1));
        assert!(run(&h).await.is_success());
    }

    #[tokio::test]
    async fn test_retries_exhausted_moves_to_failed() {
        let h = harness();
        register(&h, 2);
        for _ in 0..2 {
            h.adapter
                .then_fail(AcmeError::AuthorityUnreachable("timeout".to_string()));
        }

        assert!(matches!(run(&h).await, JobOutcome::Deferred { .. }));
        h.clock.advance(Duration::days(1));
        let outcome = run(&h).await;

        let record = get(&h);
        assert!(matches!(outcome, JobOutcome::Failed { kind: ErrorKind::AuthorityUnreachable, .. }));
        assert_eq!(record.state, CertificateState::Failed);
        assert_eq!(record.failure_count, 2);
        assert!(!record.is_due(h.clock.now() + Duration::days(1), Duration::zero()));
    }

    #[tokio::test]
    async fn test_issuance_failure_retries_from_failed() {
        let h = harness();
        register(&h, 5);
        h.adapter
            .then_fail(AcmeError::IssuanceFailed("finalize rejected".to_string()));

        assert!(matches!(run(&h).await, JobOutcome::Failed { kind: ErrorKind::IssuanceFailed, .. }));
        let record = get(&h);
        assert_eq!(record.state, CertificateState::Failed);
        assert!(record.next_attempt_at.is_some());

        h.clock.advance(Duration::days(1));
        assert!(get(&h).is_due(h.clock.now(), Duration::zero()));
        assert!(run(&h).await.is_success());
        assert_eq!(get(&h).failure_count, 0);
    }

    #[tokio::test]
    async fn test_renewal_failure_keeps_old_certificate() {
        let h = harness();
        register(&h, 5);
        run(&h).await;
        let before = get(&h);

        h.orchestrator.mark_renewal_due(&id()).unwrap();
        h.adapter
            .then_fail(AcmeError::AuthorityUnreachable("connect".to_string()));
        let outcome = run(&h).await;
        let record = get(&h);

        assert!(matches!(outcome, JobOutcome::Deferred { .. }));
        assert_eq!(record.state, CertificateState::RenewalDue);
        assert_eq!(record.artifacts(), before.artifacts());
        assert!(h.store.load_artifacts(&id(), &before.artifacts().unwrap()).is_ok());
        assert_eq!(record.failure_count, 1);
    }

    #[tokio::test]
    async fn test_rejected_renewal_moves_to_failed() {
        let h = harness();
        register(&h, 5);
        run(&h).await;
        h.orchestrator.mark_renewal_due(&id()).unwrap();
        h.adapter
            .then_fail(AcmeError::InvalidDomain("caa forbids issuance".to_string()));

        run(&h).await;
        let record = get(&h);
        assert_eq!(record.state, CertificateState::Failed);
        assert!(record.artifacts().is_some());
        assert!(record.servable_artifacts(h.clock.now()).is_some());
        let expiry = record.not_after.unwrap();
        assert!(record.servable_artifacts(expiry).is_none());
    }

    #[tokio::test]
    async fn test_cancellation_restores_state() {
        let h = harness_with(|clock| ScriptedAdapter {
            stall: true,
            ..ScriptedAdapter::new(clock)
        });
        register(&h, 5);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = h.orchestrator.process(&id(), &cancel).await.unwrap();

        assert_eq!(outcome, JobOutcome::Cancelled);
        let record = get(&h);
        assert_eq!(record.state, CertificateState::Pending);
        assert_eq!(record.failure_count, 0);
        assert_eq!(h.store.artifact_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_copy_is_retried_once() {
        let h = harness();
        let stale = register(&h, 5);

        let mut bumped = stale.clone();
        bumped.hooks.clear();
        h.store.upsert(bumped).unwrap();

        let updated = h
            .orchestrator
            .update(&stale, |r| r.apply(LifecycleEvent::Revoke).map(drop))
            .unwrap();
        assert_eq!(updated.state, CertificateState::Revoked);
        assert!(updated.hooks.is_empty());
        assert_eq!(updated.version, 3);
    }

    #[tokio::test]
    async fn test_register_validation() {
        let h = harness();
        register(&h, 5);

        let again = h.orchestrator.register(
            DomainSet::new(["example.com"]).unwrap(),
            RenewalPolicy::default(),
            ChallengeKind::Http01,
            Vec::new(),
        );
        assert!(matches!(again, Err(LifecycleError::AlreadyRegistered(_))));

        let wildcard = h.orchestrator.register(
            DomainSet::new(["*.example.org"]).unwrap(),
            RenewalPolicy::default(),
            ChallengeKind::Http01,
            Vec::new(),
        );
        assert!(matches!(wildcard, Err(LifecycleError::Domain(_))));

        let hook = h.orchestrator.register(
            DomainSet::new(["example.org"]).unwrap(),
            RenewalPolicy::default(),
            ChallengeKind::Http01,
            vec!["missing".to_string()],
        );
        assert!(matches!(hook, Err(LifecycleError::UnknownHook(_))));
    }

    #[tokio::test]
    async fn test_revoked_is_terminal() {
        let h = harness();
        register(&h, 5);
        run(&h).await;

        h.orchestrator.revoke(&id()).unwrap();
        assert_eq!(get(&h).state, CertificateState::Revoked);
        assert!(matches!(
            h.orchestrator.revoke(&id()),
            Err(LifecycleError::InvalidTransition { .. })
        ));
        assert!(matches!(
            h.orchestrator.reset(&id()),
            Err(LifecycleError::InvalidTransition { .. })
        ));
        assert_eq!(run(&h).await, JobOutcome::Skipped("revoked"));
    }
}
