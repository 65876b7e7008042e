//! ACME account credential storage

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, trace};

use super::error::AccountError;

/// Persists the opaque account credentials JSON
#[derive(Debug, Clone)]
pub struct AccountStore {
    account_dir: PathBuf,
}

impl AccountStore {
    /// Account storage below `<storage>/account`
    pub fn new(storage_path: &Path) -> Self {
        Self {
            account_dir: storage_path.join("account"),
        }
    }

    fn credentials_path(&self) -> PathBuf {
        self.account_dir.join("credentials.json")
    }

    /// Load raw credentials JSON (for `instant_acme::AccountCredentials`)
    pub fn load_credentials_json(&self) -> Result<Option<String>, AccountError> {
        let path = self.credentials_path();
        if !path.exists() {
            trace!("No stored ACME credentials found");
            return Ok(None);
        }

        let content = fs::read_to_string(&path)?;
        debug!("Loaded ACME credentials JSON");
        Ok(Some(content))
    }

    /// Save raw credentials JSON with owner-only permissions
    pub fn save_credentials_json(&self, json: &str) -> Result<(), AccountError> {
        fs::create_dir_all(&self.account_dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.account_dir, fs::Permissions::from_mode(0o700))?;
        }

        crate::store::write_atomic(&self.credentials_path(), json.as_bytes(), 0o600)?;

        info!("Saved ACME credentials JSON");
        Ok(())
    }
}
