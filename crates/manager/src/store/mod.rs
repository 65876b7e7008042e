//! Durable certificate records and artifacts.
//!
//! # Directory Structure
//!
//! ```text
//! storage/
//! ├── account/
//! │   └── credentials.json        # ACME account credentials (0600)
//! └── records/
//!     ├── .owner.lock             # Held by the running daemon
//!     ├── .write.lock             # Held around each record update
//!     └── example.com/
//!         ├── record.json         # Versioned record
//!         └── artifacts/
//!             └── <generation>/
//!                 ├── cert.pem    # Certificate chain
//!                 └── key.pem     # Private key (0600)
//! ```
//!
//! All mutation goes through [`CertificateStore::upsert`], which only
//! succeeds when the caller saw the latest version.

mod fs;
mod lock;
mod memory;

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use warden_common::CertificateId;

use crate::errors::{ErrorKind, StoreError};
use crate::record::{CertificateMaterial, CertificateRecord, CertificateState, StoredArtifacts};

pub(crate) use fs::write_atomic;
pub use fs::FsCertificateStore;
pub use memory::MemoryCertificateStore;

/// Key and chain read back from the store
#[derive(Clone)]
pub struct LoadedArtifacts {
    pub chain_pem: String,
    pub key_pem: String,
}

impl fmt::Debug for LoadedArtifacts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedArtifacts")
            .field("chain_len", &self.chain_pem.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Persistence for certificate records and their key material
pub trait CertificateStore: Send + Sync + fmt::Debug {
    fn get(&self, id: &CertificateId) -> Result<Option<CertificateRecord>, StoreError>;

    /// Insert or replace a record.
    ///
    /// Succeeds only if `record.version` equals the stored version (0 when
    /// absent). Returns the record as stored, with its version incremented.
    fn upsert(&self, record: CertificateRecord) -> Result<CertificateRecord, StoreError>;

    fn list(&self) -> Result<Vec<CertificateRecord>, StoreError>;

    /// Remove a record and every artifact it owns
    fn delete(&self, id: &CertificateId) -> Result<CertificateRecord, StoreError>;

    /// Persist new key material without touching the record
    fn store_artifacts(
        &self,
        id: &CertificateId,
        material: &CertificateMaterial,
    ) -> Result<StoredArtifacts, StoreError>;

    fn load_artifacts(
        &self,
        id: &CertificateId,
        artifacts: &StoredArtifacts,
    ) -> Result<LoadedArtifacts, StoreError>;

    fn discard_artifacts(
        &self,
        id: &CertificateId,
        artifacts: &StoredArtifacts,
    ) -> Result<(), StoreError>;

    /// Filesystem location of an artifact, for stores that have one
    fn artifact_path(&self, id: &CertificateId, artifacts: &StoredArtifacts)
        -> Option<(PathBuf, PathBuf)>;

    /// Records the scheduler should act on now, most urgent first
    fn list_due(
        &self,
        now: DateTime<Utc>,
        horizon: Duration,
    ) -> Result<Vec<CertificateRecord>, StoreError> {
        let mut due: Vec<CertificateRecord> = self
            .list()?
            .into_iter()
            .filter(|r| r.is_due(now, horizon))
            .collect();
        due.sort_by(|a, b| a.not_after.cmp(&b.not_after).then_with(|| a.id.cmp(&b.id)));
        Ok(due)
    }

    /// Earliest pending retry among records that are waiting on backoff
    fn next_wakeup(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .list()?
            .iter()
            .filter(|r| {
                matches!(
                    r.state,
                    CertificateState::Pending
                        | CertificateState::Active
                        | CertificateState::RenewalDue
                        | CertificateState::Failed
                )
            })
            .filter_map(|r| r.next_attempt_at)
            .filter(|at| *at > now)
            .min())
    }
}

/// Bring a record loaded after a restart back to a consistent state.
///
/// Returns `None` when nothing changed.
pub fn recover_record(
    record: &CertificateRecord,
    artifacts_readable: bool,
    now: DateTime<Utc>,
) -> Option<CertificateRecord> {
    let mut recovered = record.clone();

    match recovered.state {
        CertificateState::Renewing => recovered.state = CertificateState::Active,
        CertificateState::ChallengePending | CertificateState::Issuing => {
            recovered.state = CertificateState::Pending
        }
        _ => {}
    }

    if recovered.state.is_servable() && !artifacts_readable {
        warn!(
            certificate_id = %record.id,
            state = %record.state,
            "Referenced artifacts are missing, marking certificate failed"
        );
        recovered.state = CertificateState::Failed;
        recovered.record_failure(
            now,
            ErrorKind::ArtifactCorruption,
            "certificate or key missing from storage",
            None,
        );
    }

    if recovered == *record {
        None
    } else {
        recovered.updated_at = now;
        Some(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ArtifactRef;
    use chrono::TimeZone;
    use warden_common::{ChallengeKind, DomainSet, RenewalPolicy};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
    }

    fn record(state: CertificateState) -> CertificateRecord {
        let mut r = CertificateRecord::new(
            DomainSet::new(["example.com"]).unwrap(),
            RenewalPolicy::default(),
            ChallengeKind::Http01,
            Vec::new(),
            now(),
        );
        r.state = state;
        r.private_key_ref = Some(ArtifactRef::new("artifacts/a/key.pem"));
        r.certificate_chain_ref = Some(ArtifactRef::new("artifacts/a/cert.pem"));
        r
    }

    #[test]
    fn test_recover_in_flight_states() {
        let r = recover_record(&record(CertificateState::Renewing), true, now()).unwrap();
        assert_eq!(r.state, CertificateState::Active);

        let r = recover_record(&record(CertificateState::Issuing), true, now()).unwrap();
        assert_eq!(r.state, CertificateState::Pending);

        let r = recover_record(&record(CertificateState::ChallengePending), true, now()).unwrap();
        assert_eq!(r.state, CertificateState::Pending);
    }

    #[test]
    fn test_recover_missing_artifacts() {
        let r = recover_record(&record(CertificateState::Active), false, now()).unwrap();
        assert_eq!(r.state, CertificateState::Failed);
        assert_eq!(r.last_error_kind(), Some(ErrorKind::ArtifactCorruption));
        assert_eq!(r.next_attempt_at, None);
    }

    #[test]
    fn test_recover_consistent_record_untouched() {
        assert!(recover_record(&record(CertificateState::Active), true, now()).is_none());
        assert!(recover_record(&record(CertificateState::Pending), false, now()).is_none());
    }
}
