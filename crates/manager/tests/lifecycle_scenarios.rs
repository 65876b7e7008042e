//! End-to-end lifecycle scenarios driven by a manual clock and a scripted
//! ACME adapter.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use warden_common::{CertificateId, ChallengeKind, Clock, DomainSet, ManualClock, RenewalPolicy};
use warden_manager::acme::AcmeAdapter;
use warden_manager::store::LoadedArtifacts;
use warden_manager::{
    AcmeError, CertificateMaterial, CertificateRecord, CertificateState, CertificateStore,
    HookRunner, JobOutcome, MemoryCertificateStore, Orchestrator, RenewalScheduler, StoreError,
    StoredArtifacts,
};

// ============================================================================
// Fixtures
// ============================================================================

/// Returns scripted errors first, then 90 day certificates
struct MockAuthority {
    clock: ManualClock,
    script: Mutex<VecDeque<AcmeError>>,
    calls: Mutex<u32>,
}

impl MockAuthority {
    fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(0),
        }
    }

    fn fail_next(&self, err: AcmeError) {
        self.script.lock().push_back(err);
    }

    fn calls(&self) -> u32 {
        *self.calls.lock()
    }
}

#[async_trait]
impl AcmeAdapter for MockAuthority {
    async fn request_certificate(
        &self,
        domains: &DomainSet,
        _challenge: ChallengeKind,
    ) -> Result<CertificateMaterial, AcmeError> {
        let call = {
            let mut calls = self.calls.lock();
            *calls += 1;
            *calls
        };
        if let Some(err) = self.script.lock().pop_front() {
            return Err(err);
        }

        let now = self.clock.now();
        Ok(CertificateMaterial {
            chain_pem: format!("chain for {} #{}", domains, call),
            key_pem: format!("key #{}", call),
            not_before: now,
            not_after: now + Duration::days(90),
        })
    }
}

/// Memory store that remembers the state of every write
#[derive(Debug, Default)]
struct RecordingStore {
    inner: MemoryCertificateStore,
    states: Mutex<Vec<CertificateState>>,
    /// When set, saving key material fails like a full disk
    artifacts_fail: AtomicBool,
}

impl RecordingStore {
    fn fail_artifacts(&self, fail: bool) {
        self.artifacts_fail.store(fail, Ordering::SeqCst);
    }

    fn states(&self) -> Vec<CertificateState> {
        self.states.lock().clone()
    }

    fn clear(&self) {
        self.states.lock().clear();
    }
}

impl CertificateStore for RecordingStore {
    fn get(&self, id: &CertificateId) -> Result<Option<CertificateRecord>, StoreError> {
        self.inner.get(id)
    }

    fn upsert(&self, record: CertificateRecord) -> Result<CertificateRecord, StoreError> {
        let stored = self.inner.upsert(record)?;
        self.states.lock().push(stored.state);
        Ok(stored)
    }

    fn list(&self) -> Result<Vec<CertificateRecord>, StoreError> {
        self.inner.list()
    }

    fn delete(&self, id: &CertificateId) -> Result<CertificateRecord, StoreError> {
        self.inner.delete(id)
    }

    fn store_artifacts(
        &self,
        id: &CertificateId,
        material: &CertificateMaterial,
    ) -> Result<StoredArtifacts, StoreError> {
        if self.artifacts_fail.load(Ordering::SeqCst) {
            return Err(StoreError::Io(std::io::Error::other("disk full")));
        }
        self.inner.store_artifacts(id, material)
    }

    fn load_artifacts(
        &self,
        id: &CertificateId,
        artifacts: &StoredArtifacts,
    ) -> Result<LoadedArtifacts, StoreError> {
        self.inner.load_artifacts(id, artifacts)
    }

    fn discard_artifacts(
        &self,
        id: &CertificateId,
        artifacts: &StoredArtifacts,
    ) -> Result<(), StoreError> {
        self.inner.discard_artifacts(id, artifacts)
    }

    fn artifact_path(
        &self,
        id: &CertificateId,
        artifacts: &StoredArtifacts,
    ) -> Option<(PathBuf, PathBuf)> {
        self.inner.artifact_path(id, artifacts)
    }
}

struct World {
    clock: ManualClock,
    store: Arc<RecordingStore>,
    authority: Arc<MockAuthority>,
    scheduler: RenewalScheduler,
    cancel: CancellationToken,
}

impl World {
    fn new() -> Self {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap());
        let store = Arc::new(RecordingStore::default());
        let authority = Arc::new(MockAuthority::new(clock.clone()));
        let hooks = HookRunner::new(Arc::new(clock.clone()))
            .with_retry_base(StdDuration::from_millis(1));
        let orchestrator = Orchestrator::new(
            store.clone(),
            authority.clone(),
            hooks,
            Arc::new(clock.clone()),
        );

        Self {
            clock,
            store,
            authority,
            scheduler: RenewalScheduler::new(Arc::new(orchestrator)).with_pool_size(2),
            cancel: CancellationToken::new(),
        }
    }

    fn orchestrator(&self) -> &Orchestrator {
        self.scheduler.orchestrator()
    }

    fn register(&self, names: &[&str]) -> CertificateId {
        let domains = DomainSet::validated(names).unwrap();
        let policy = RenewalPolicy::default().with_renew_before_days(30);
        self.orchestrator()
            .register(domains, policy, ChallengeKind::Http01, Vec::new())
            .unwrap()
            .id
    }

    fn record(&self, id: &CertificateId) -> CertificateRecord {
        self.store.get(id).unwrap().unwrap()
    }

    async fn tick(&self) -> Vec<JobOutcome> {
        self.scheduler
            .tick(&self.cancel)
            .await
            .outcomes
            .into_iter()
            .map(|(_, outcome)| outcome)
            .collect()
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_first_issuance_reports_active() {
    let world = World::new();
    let id = world.register(&["example.com"]);
    let issued_at = world.clock.now();

    let outcomes = world.tick().await;
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], JobOutcome::Issued { .. }));

    let record = world.record(&id);
    assert_eq!(record.state, CertificateState::Active);
    assert_eq!(record.not_after, Some(issued_at + Duration::days(90)));
    assert_eq!(record.failure_count, 0);
    assert!(record.servable_artifacts(world.clock.now()).is_some());
    assert_eq!(
        world.store.states(),
        vec![
            CertificateState::Pending,
            CertificateState::ChallengePending,
            CertificateState::Active,
        ]
    );
}

#[tokio::test]
async fn test_renewal_after_sixty_one_days() {
    let world = World::new();
    let id = world.register(&["example.com"]);
    world.tick().await;
    let first = world.record(&id);
    let old_artifacts = first.artifacts().unwrap();

    // Day 59: 31 days left, outside the 30 day window
    world.clock.advance(Duration::days(59));
    assert!(world.tick().await.is_empty());

    world.clock.advance(Duration::days(2));
    let renewed_at = world.clock.now();
    world.store.clear();

    let outcomes = world.tick().await;
    assert!(matches!(outcomes[0], JobOutcome::Renewed { .. }));

    let record = world.record(&id);
    assert_eq!(record.state, CertificateState::Active);
    assert_eq!(record.not_after, Some(renewed_at + Duration::days(90)));
    assert_ne!(record.artifacts().unwrap(), old_artifacts);
    assert_eq!(
        world.store.states(),
        vec![CertificateState::Renewing, CertificateState::Active]
    );

    // Old key material is gone, only the new generation remains
    assert!(world.store.load_artifacts(&id, &old_artifacts).is_err());
    assert_eq!(world.store.inner.artifact_count(), 2);
    assert_eq!(world.store.list().unwrap().len(), 1);
}

#[tokio::test]
async fn test_challenge_failure_waits_for_reset() {
    let world = World::new();
    let id = world.register(&["example.com"]);
    world.authority.fail_next(AcmeError::ChallengeFailed {
        domain: "example.com".to_string(),
        detail: "connection refused".to_string(),
    });

    let outcomes = world.tick().await;
    assert!(matches!(outcomes[0], JobOutcome::Failed { .. }));
    let record = world.record(&id);
    assert_eq!(record.state, CertificateState::Failed);
    assert_eq!(record.failure_count, 1);

    for _ in 0..3 {
        world.clock.advance(Duration::days(1));
        assert!(world.tick().await.is_empty());
    }
    assert_eq!(world.authority.calls(), 1);

    world.orchestrator().reset(&id).unwrap();
    let outcomes = world.tick().await;
    assert!(matches!(outcomes[0], JobOutcome::Issued { .. }));
    assert_eq!(world.authority.calls(), 2);
}

#[tokio::test]
async fn test_rate_limit_defers_retry() {
    let world = World::new();
    let id = world.register(&["example.com"]);
    world.authority.fail_next(AcmeError::RateLimited {
        retry_after: StdDuration::from_secs(3600),
        detail: "too many new orders".to_string(),
    });
    let limited_at = world.clock.now();

    let outcomes = world.tick().await;
    assert!(matches!(outcomes[0], JobOutcome::Deferred { .. }));
    let record = world.record(&id);
    assert_eq!(record.state, CertificateState::Pending);
    assert_eq!(record.next_attempt_at, Some(limited_at + Duration::hours(1)));

    world.clock.advance(Duration::minutes(59));
    assert!(world.tick().await.is_empty());
    assert_eq!(world.authority.calls(), 1);

    world.clock.advance(Duration::minutes(1));
    let outcomes = world.tick().await;
    assert!(matches!(outcomes[0], JobOutcome::Issued { .. }));
    assert_eq!(world.authority.calls(), 2);
    assert_eq!(world.record(&id).failure_count, 0);
}

#[tokio::test]
async fn test_artifact_write_failure_releases_new_certificate() {
    let world = World::new();
    let id = world.register(&["example.com"]);
    world.store.fail_artifacts(true);
    let failed_at = world.clock.now();

    let outcomes = world.tick().await;
    assert!(matches!(outcomes[0], JobOutcome::Deferred { .. }));

    let record = world.record(&id);
    assert_eq!(record.state, CertificateState::Pending);
    assert_eq!(record.failure_count, 1);
    assert_eq!(record.next_attempt_at, Some(failed_at + Duration::minutes(5)));
    assert!(record.artifacts().is_none());

    world.store.fail_artifacts(false);
    world.clock.advance(Duration::minutes(5));
    let outcomes = world.tick().await;
    assert!(matches!(outcomes[0], JobOutcome::Issued { .. }));
    assert_eq!(world.record(&id).state, CertificateState::Active);
    assert_eq!(world.authority.calls(), 2);
}

#[tokio::test]
async fn test_artifact_write_failure_keeps_serving_during_renewal() {
    let world = World::new();
    let id = world.register(&["example.com"]);
    world.tick().await;
    let before = world.record(&id).artifacts().unwrap();

    world.clock.advance(Duration::days(61));
    world.store.fail_artifacts(true);
    world.store.clear();

    let outcomes = world.tick().await;
    assert!(matches!(outcomes[0], JobOutcome::Deferred { .. }));
    assert_eq!(
        world.store.states(),
        vec![CertificateState::Renewing, CertificateState::Active]
    );

    let record = world.record(&id);
    assert_eq!(record.failure_count, 1);
    assert_eq!(record.servable_artifacts(world.clock.now()), Some(before.clone()));
    assert!(world.store.load_artifacts(&id, &before).is_ok());
}

#[tokio::test]
async fn test_record_left_renewing_is_picked_up_again() {
    let world = World::new();
    let id = world.register(&["example.com"]);
    world.tick().await;
    world.clock.advance(Duration::days(61));

    let mut stuck = world.record(&id);
    stuck.state = CertificateState::Renewing;
    world.store.upsert(stuck).unwrap();
    world.store.clear();

    let outcomes = world.tick().await;
    assert!(matches!(outcomes[0], JobOutcome::Renewed { .. }));
    assert_eq!(
        world.store.states(),
        vec![
            CertificateState::Active,
            CertificateState::Renewing,
            CertificateState::Active,
        ]
    );
}

#[test]
fn test_stale_upsert_conflicts() {
    let store = MemoryCertificateStore::new();
    let domains = DomainSet::new(["example.com"]).unwrap();
    let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
    let record = CertificateRecord::new(
        domains,
        RenewalPolicy::default(),
        ChallengeKind::Http01,
        Vec::new(),
        now,
    );
    let stored = store.upsert(record).unwrap();
    assert_eq!(stored.version, 1);

    let mut first = stored.clone();
    let mut second = stored;
    first.failure_count = 1;
    second.failure_count = 2;

    assert_eq!(store.upsert(first).unwrap().version, 2);
    let err = store.upsert(second).unwrap_err();
    assert!(matches!(
        err,
        StoreError::Conflict {
            expected: 1,
            actual: 2,
            ..
        }
    ));
    assert_eq!(store.get(&CertificateId::new("example.com")).unwrap().unwrap().failure_count, 1);
}

// ============================================================================
// Boundaries
// ============================================================================

#[test]
fn test_due_check_is_inclusive_at_window_edge() {
    let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
    let mut record = CertificateRecord::new(
        DomainSet::new(["example.com"]).unwrap(),
        RenewalPolicy::default().with_renew_before_days(30),
        ChallengeKind::Http01,
        Vec::new(),
        now,
    );
    record.state = CertificateState::Active;

    record.not_after = Some(now + Duration::days(30));
    assert!(record.is_due(now, Duration::zero()));

    record.not_after = Some(now + Duration::days(30) + Duration::seconds(1));
    assert!(!record.is_due(now, Duration::zero()));
    assert!(record.is_due(now, Duration::seconds(1)));
}

#[tokio::test]
async fn test_every_write_bumps_version_once() {
    let world = World::new();
    let id = world.register(&["example.com", "www.example.com"]);
    assert_eq!(world.record(&id).version, 1);

    world.tick().await;
    let record = world.record(&id);
    assert_eq!(record.version as usize, world.store.states().len());
    assert_eq!(record.domains.primary(), "example.com");
    assert_eq!(record.domains.len(), 2);
}

#[tokio::test]
async fn test_revoked_record_is_never_scheduled() {
    let world = World::new();
    let id = world.register(&["example.com"]);
    world.tick().await;
    world.orchestrator().revoke(&id).unwrap();

    world.clock.advance(Duration::days(89));
    assert!(world.tick().await.is_empty());
    assert_eq!(world.record(&id).state, CertificateState::Revoked);
    assert_eq!(world.authority.calls(), 1);
}
