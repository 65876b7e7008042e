//! In-memory certificate store
//!
//! Holds records and artifacts in process memory. Used by tests and by
//! dry runs that should never touch the storage directory.

use std::collections::HashMap;
use std::path::PathBuf;

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, trace};
use uuid::Uuid;

use warden_common::CertificateId;

use super::{CertificateStore, LoadedArtifacts};
use crate::errors::StoreError;
use crate::record::{ArtifactRef, CertificateMaterial, CertificateRecord, StoredArtifacts};

/// Store backed by process memory
#[derive(Debug, Default)]
pub struct MemoryCertificateStore {
    records: RwLock<HashMap<CertificateId, CertificateRecord>>,
    /// Artifact reference -> PEM contents
    artifacts: DashMap<ArtifactRef, String>,
}

impl MemoryCertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of artifacts currently held
    pub fn artifact_count(&self) -> usize {
        self.artifacts.len()
    }

    fn read_artifact(&self, id: &CertificateId, reference: &ArtifactRef) -> Result<String, StoreError> {
        self.artifacts
            .get(reference)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::ArtifactCorruption {
                id: id.clone(),
                reason: format!("{} not present", reference),
            })
    }
}

impl CertificateStore for MemoryCertificateStore {
    fn get(&self, id: &CertificateId) -> Result<Option<CertificateRecord>, StoreError> {
        Ok(self.records.read().get(id).cloned())
    }

    fn upsert(&self, mut record: CertificateRecord) -> Result<CertificateRecord, StoreError> {
        let mut records = self.records.write();
        let stored_version = records.get(&record.id).map_or(0, |r| r.version);

        if stored_version != record.version {
            debug!(
                certificate_id = %record.id,
                expected = record.version,
                actual = stored_version,
                "Rejecting stale record update"
            );
            return Err(StoreError::Conflict {
                id: record.id,
                expected: record.version,
                actual: stored_version,
            });
        }

        record.version += 1;
        records.insert(record.id.clone(), record.clone());
        trace!(certificate_id = %record.id, version = record.version, "Stored record");
        Ok(record)
    }

    fn list(&self) -> Result<Vec<CertificateRecord>, StoreError> {
        let mut all: Vec<CertificateRecord> = self.records.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    fn delete(&self, id: &CertificateId) -> Result<CertificateRecord, StoreError> {
        let removed = self
            .records
            .write()
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        let prefix = format!("{}/", id);
        self.artifacts.retain(|reference, _| !reference.as_str().starts_with(&prefix));
        Ok(removed)
    }

    fn store_artifacts(
        &self,
        id: &CertificateId,
        material: &CertificateMaterial,
    ) -> Result<StoredArtifacts, StoreError> {
        let generation = Uuid::new_v4().simple().to_string();
        let stored = StoredArtifacts {
            private_key_ref: ArtifactRef::new(format!("{}/{}/key.pem", id, generation)),
            certificate_chain_ref: ArtifactRef::new(format!("{}/{}/cert.pem", id, generation)),
        };

        self.artifacts
            .insert(stored.private_key_ref.clone(), material.key_pem.clone());
        self.artifacts
            .insert(stored.certificate_chain_ref.clone(), material.chain_pem.clone());
        Ok(stored)
    }

    fn load_artifacts(
        &self,
        id: &CertificateId,
        artifacts: &StoredArtifacts,
    ) -> Result<LoadedArtifacts, StoreError> {
        Ok(LoadedArtifacts {
            chain_pem: self.read_artifact(id, &artifacts.certificate_chain_ref)?,
            key_pem: self.read_artifact(id, &artifacts.private_key_ref)?,
        })
    }

    fn discard_artifacts(
        &self,
        _id: &CertificateId,
        artifacts: &StoredArtifacts,
    ) -> Result<(), StoreError> {
        self.artifacts.remove(&artifacts.private_key_ref);
        self.artifacts.remove(&artifacts.certificate_chain_ref);
        Ok(())
    }

    fn artifact_path(
        &self,
        _id: &CertificateId,
        _artifacts: &StoredArtifacts,
    ) -> Option<(PathBuf, PathBuf)> {
        None
    }
}
