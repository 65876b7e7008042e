//! Filesystem certificate store
//!
//! One directory per certificate with restrictive permissions. Every write
//! goes to a temporary file first and is renamed into place, so a crash
//! never leaves a half-written record or key behind.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use warden_common::CertificateId;

use super::lock::DirLock;
use super::{recover_record, CertificateStore, LoadedArtifacts};
use crate::errors::StoreError;
use crate::record::{ArtifactRef, CertificateMaterial, CertificateRecord, StoredArtifacts};

const RECORD_FILE: &str = "record.json";
const ARTIFACTS_DIR: &str = "artifacts";
const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";
const OWNER_LOCK: &str = ".owner.lock";
const WRITE_LOCK: &str = ".write.lock";

/// Durable store rooted at the configured storage directory
#[derive(Debug)]
pub struct FsCertificateStore {
    base_path: PathBuf,
    records_path: PathBuf,
    /// Serializes read-compare-write in `upsert` within this process
    write_lock: Mutex<()>,
    /// Present when this store owns the directory
    owner: Option<DirLock>,
}

impl FsCertificateStore {
    /// Open the store as its owner, creating the directory structure if
    /// needed.
    ///
    /// Only one owner may exist per directory; a second `open` fails with
    /// [`StoreError::Locked`]. Records left mid-flight by a previous run are
    /// recovered and artifacts no record references are removed.
    pub fn open(base_path: &Path) -> Result<Self, StoreError> {
        let mut store = Self::open_shared(base_path)?;
        let lock_path = store.records_path.join(OWNER_LOCK);
        let owner = DirLock::try_acquire(&lock_path)?.ok_or(StoreError::Locked(lock_path))?;
        store.owner = Some(owner);

        let recovered = store.recover()?;
        info!(
            storage_path = %base_path.display(),
            recovered,
            "Opened certificate store"
        );
        Ok(store)
    }

    /// Open the store alongside a possibly running owner.
    ///
    /// No recovery and no sweep: records in flight and fresh artifact
    /// generations may belong to the owner's running jobs.
    pub fn open_shared(base_path: &Path) -> Result<Self, StoreError> {
        let records_path = base_path.join("records");
        create_private_dir(base_path)?;
        create_private_dir(&records_path)?;

        debug!(storage_path = %base_path.display(), "Opened certificate store without ownership");
        Ok(Self {
            base_path: base_path.to_path_buf(),
            records_path,
            write_lock: Mutex::new(()),
            owner: None,
        })
    }

    /// Whether this store holds the owner lock
    pub fn is_owner(&self) -> bool {
        self.owner.is_some()
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn record_dir(&self, id: &CertificateId) -> Result<PathBuf, StoreError> {
        Ok(self.records_path.join(dir_name(id)?))
    }

    /// Exclusive access for a read-compare-write, across threads and processes
    fn lock_writes(&self) -> Result<(MutexGuard<'_, ()>, DirLock), StoreError> {
        let guard = self.write_lock.lock();
        let file_lock = DirLock::acquire(&self.records_path.join(WRITE_LOCK))?;
        Ok((guard, file_lock))
    }

    fn read_record(&self, dir: &Path) -> Result<Option<CertificateRecord>, StoreError> {
        let path = dir.join(RECORD_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    fn write_record(&self, dir: &Path, record: &CertificateRecord) -> Result<(), StoreError> {
        create_private_dir(dir)?;
        let content = serde_json::to_vec_pretty(record)?;
        write_atomic(&dir.join(RECORD_FILE), &content, 0o600)?;
        Ok(())
    }

    /// Resolve an artifact reference, refusing anything outside the record directory
    fn resolve(&self, id: &CertificateId, reference: &ArtifactRef) -> Result<PathBuf, StoreError> {
        let relative = Path::new(reference.as_str());
        let escapes = relative.is_absolute()
            || relative
                .components()
                .any(|c| !matches!(c, std::path::Component::Normal(_)));
        if escapes || !reference.as_str().starts_with(ARTIFACTS_DIR) {
            return Err(StoreError::ArtifactCorruption {
                id: id.clone(),
                reason: format!("invalid artifact reference '{}'", reference),
            });
        }
        Ok(self.record_dir(id)?.join(relative))
    }

    fn artifacts_readable(&self, record: &CertificateRecord) -> bool {
        match record.artifacts() {
            Some(artifacts) => self.load_artifacts(&record.id, &artifacts).is_ok(),
            None => false,
        }
    }

    /// Startup recovery pass. Returns the number of records rewritten.
    fn recover(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut rewritten = 0;
        let _locks = self.lock_writes()?;

        for record in self.list()? {
            let readable = self.artifacts_readable(&record);
            if let Some(mut fixed) = recover_record(&record, readable, now) {
                info!(
                    certificate_id = %record.id,
                    from = %record.state,
                    to = %fixed.state,
                    "Recovered certificate record"
                );
                fixed.version = record.version + 1;
                self.write_record(&self.record_dir(&record.id)?, &fixed)?;
                rewritten += 1;
            }

            self.sweep_orphans(&record)?;
        }

        Ok(rewritten)
    }

    /// Remove artifact generations the record does not reference
    fn sweep_orphans(&self, record: &CertificateRecord) -> Result<(), StoreError> {
        let artifacts_dir = self.record_dir(&record.id)?.join(ARTIFACTS_DIR);
        if !artifacts_dir.exists() {
            return Ok(());
        }

        let referenced: HashSet<String> = [&record.private_key_ref, &record.certificate_chain_ref]
            .into_iter()
            .flatten()
            .filter_map(|r| generation_of(r).map(str::to_string))
            .collect();

        for entry in fs::read_dir(&artifacts_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !referenced.contains(&name) {
                debug!(
                    certificate_id = %record.id,
                    generation = %name,
                    "Removing unreferenced artifacts"
                );
                fs::remove_dir_all(entry.path())?;
            }
        }
        Ok(())
    }
}

impl CertificateStore for FsCertificateStore {
    fn get(&self, id: &CertificateId) -> Result<Option<CertificateRecord>, StoreError> {
        self.read_record(&self.record_dir(id)?)
    }

    fn upsert(&self, mut record: CertificateRecord) -> Result<CertificateRecord, StoreError> {
        let dir = self.record_dir(&record.id)?;
        let _locks = self.lock_writes()?;

        let stored_version = self.read_record(&dir)?.map_or(0, |r| r.version);
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
        self.write_record(&dir, &record)?;
        trace!(
            certificate_id = %record.id,
            version = record.version,
            state = %record.state,
            "Stored record"
        );
        Ok(record)
    }

    fn list(&self) -> Result<Vec<CertificateRecord>, StoreError> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.records_path)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            match self.read_record(&entry.path()) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        path = %entry.path().display(),
                        error = %e,
                        "Skipping unreadable certificate record"
                    );
                }
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    fn delete(&self, id: &CertificateId) -> Result<CertificateRecord, StoreError> {
        let dir = self.record_dir(id)?;
        let _locks = self.lock_writes()?;

        let record = self
            .read_record(&dir)?
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        fs::remove_dir_all(&dir)?;
        info!(certificate_id = %id, "Deleted certificate record and artifacts");
        Ok(record)
    }

    fn store_artifacts(
        &self,
        id: &CertificateId,
        material: &CertificateMaterial,
    ) -> Result<StoredArtifacts, StoreError> {
        let generation = Uuid::new_v4().simple().to_string();
        let relative = Path::new(ARTIFACTS_DIR).join(&generation);
        let dir = self.record_dir(id)?.join(&relative);
        create_private_dir(&dir)?;

        write_atomic(&dir.join(KEY_FILE), material.key_pem.as_bytes(), 0o600)?;
        write_atomic(&dir.join(CERT_FILE), material.chain_pem.as_bytes(), 0o644)?;

        debug!(
            certificate_id = %id,
            generation = %generation,
            not_after = %material.not_after,
            "Saved certificate artifacts"
        );

        Ok(StoredArtifacts {
            private_key_ref: ArtifactRef::new(format!("{}/{}/{}", ARTIFACTS_DIR, generation, KEY_FILE)),
            certificate_chain_ref: ArtifactRef::new(format!(
                "{}/{}/{}",
                ARTIFACTS_DIR, generation, CERT_FILE
            )),
        })
    }

    fn load_artifacts(
        &self,
        id: &CertificateId,
        artifacts: &StoredArtifacts,
    ) -> Result<LoadedArtifacts, StoreError> {
        let read = |reference: &ArtifactRef| -> Result<String, StoreError> {
            let path = self.resolve(id, reference)?;
            fs::read_to_string(&path).map_err(|e| StoreError::ArtifactCorruption {
                id: id.clone(),
                reason: format!("{}: {}", path.display(), e),
            })
        };

        Ok(LoadedArtifacts {
            chain_pem: read(&artifacts.certificate_chain_ref)?,
            key_pem: read(&artifacts.private_key_ref)?,
        })
    }

    fn discard_artifacts(
        &self,
        id: &CertificateId,
        artifacts: &StoredArtifacts,
    ) -> Result<(), StoreError> {
        for reference in [&artifacts.private_key_ref, &artifacts.certificate_chain_ref] {
            let path = self.resolve(id, reference)?;
            if let Some(generation_dir) = path.parent() {
                if generation_dir.exists() {
                    fs::remove_dir_all(generation_dir)?;
                    debug!(
                        certificate_id = %id,
                        path = %generation_dir.display(),
                        "Retired certificate artifacts"
                    );
                }
            }
        }
        Ok(())
    }

    fn artifact_path(
        &self,
        id: &CertificateId,
        artifacts: &StoredArtifacts,
    ) -> Option<(PathBuf, PathBuf)> {
        let cert = self.resolve(id, &artifacts.certificate_chain_ref).ok()?;
        let key = self.resolve(id, &artifacts.private_key_ref).ok()?;
        Some((cert, key))
    }
}

/// Directory name for a certificate id. Wildcards map `*` to `_`, which
/// cannot occur in a valid hostname.
fn dir_name(id: &CertificateId) -> Result<String, StoreError> {
    let raw = id.as_str();
    let valid = !raw.is_empty()
        && raw != "."
        && raw != ".."
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '*'));
    if !valid {
        return Err(StoreError::InvalidId(raw.to_string()));
    }
    Ok(raw.replace('*', "_"))
}

fn generation_of(reference: &ArtifactRef) -> Option<&str> {
    reference.as_str().split('/').nth(1)
}

fn create_private_dir(path: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }

    Ok(())
}

/// Write to a sibling temp file, sync, then rename over `path`
pub(crate) fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.tmp", file_name));

    {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;

        let mut file = options.open(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }

    fs::rename(&tmp, path)?;
    Ok(())
}
