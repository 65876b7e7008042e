//! Challenge responders
//!
//! A responder makes a challenge answer visible to the authority: an
//! HTTP-01 token served at `/.well-known/acme-challenge/<token>`, or a
//! DNS-01 TXT record at `_acme-challenge.<domain>`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::error::ChallengeError;
use crate::shell::{run_shell, stderr_tail, ShellError};

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Places and removes challenge answers
#[async_trait]
pub trait ChallengeResponder: Send + Sync {
    async fn place_http_token(
        &self,
        domain: &str,
        token: &str,
        key_authorization: &str,
    ) -> Result<(), ChallengeError>;

    async fn remove_http_token(&self, domain: &str, token: &str) -> Result<(), ChallengeError>;

    async fn create_dns_record(
        &self,
        domain: &str,
        name: &str,
        value: &str,
    ) -> Result<(), ChallengeError>;

    async fn remove_dns_record(
        &self,
        domain: &str,
        name: &str,
        value: &str,
    ) -> Result<(), ChallengeError>;
}

/// TXT record name for a DNS-01 challenge. Wildcards validate on the base name.
pub fn dns_record_name(domain: &str) -> String {
    format!("_acme-challenge.{}", domain.trim_start_matches("*."))
}

// ============================================================================
// In-process token registry
// ============================================================================

/// Token registry for an embedding HTTP server.
///
/// The server answers requests under [`ACME_CHALLENGE_PREFIX`] with
/// [`HttpTokenRegistry::get_response`]. Clones share the same tokens.
#[derive(Debug, Clone, Default)]
pub struct HttpTokenRegistry {
    /// Map of challenge token -> key authorization response
    tokens: Arc<DashMap<String, String>>,
}

impl HttpTokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key authorization for a token, if one is pending
    pub fn get_response(&self, token: &str) -> Option<String> {
        let result = self.tokens.get(token).map(|v| v.clone());
        trace!(token = %token, found = result.is_some(), "ACME challenge token lookup");
        result
    }

    /// Token from a request path under the challenge prefix
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
    }

    pub fn pending_count(&self) -> usize {
        self.tokens.len()
    }
}

#[async_trait]
impl ChallengeResponder for HttpTokenRegistry {
    async fn place_http_token(
        &self,
        domain: &str,
        token: &str,
        key_authorization: &str,
    ) -> Result<(), ChallengeError> {
        debug!(domain = %domain, token = %token, "Registering HTTP-01 token");
        self.tokens
            .insert(token.to_string(), key_authorization.to_string());
        Ok(())
    }

    async fn remove_http_token(&self, domain: &str, token: &str) -> Result<(), ChallengeError> {
        if self.tokens.remove(token).is_some() {
            debug!(domain = %domain, token = %token, "Removed HTTP-01 token");
        }
        Ok(())
    }

    async fn create_dns_record(&self, _: &str, _: &str, _: &str) -> Result<(), ChallengeError> {
        Err(ChallengeError::Unsupported("dns-01"))
    }

    async fn remove_dns_record(&self, _: &str, _: &str, _: &str) -> Result<(), ChallengeError> {
        Err(ChallengeError::Unsupported("dns-01"))
    }
}

// ============================================================================
// Webroot
// ============================================================================

/// Writes token files below a directory served by an external web server
#[derive(Debug, Clone)]
pub struct WebrootResponder {
    webroot: PathBuf,
}

impl WebrootResponder {
    pub fn new(webroot: impl Into<PathBuf>) -> Self {
        Self {
            webroot: webroot.into(),
        }
    }

    fn challenge_dir(&self) -> PathBuf {
        self.webroot.join(".well-known").join("acme-challenge")
    }

    fn token_path(&self, token: &str) -> Result<PathBuf, ChallengeError> {
        // Tokens are base64url; anything else must not become a path
        if token.is_empty()
            || !token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ChallengeError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("refusing token '{}'", token),
            )));
        }
        Ok(self.challenge_dir().join(token))
    }

    pub fn webroot(&self) -> &Path {
        &self.webroot
    }
}

#[async_trait]
impl ChallengeResponder for WebrootResponder {
    async fn place_http_token(
        &self,
        domain: &str,
        token: &str,
        key_authorization: &str,
    ) -> Result<(), ChallengeError> {
        let path = self.token_path(token)?;
        tokio::fs::create_dir_all(self.challenge_dir()).await?;
        tokio::fs::write(&path, key_authorization).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).await?;
        }

        debug!(domain = %domain, path = %path.display(), "Placed webroot challenge file");
        Ok(())
    }

    async fn remove_http_token(&self, domain: &str, token: &str) -> Result<(), ChallengeError> {
        let path = self.token_path(token)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(domain = %domain, path = %path.display(), "Removed webroot challenge file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_dns_record(&self, _: &str, _: &str, _: &str) -> Result<(), ChallengeError> {
        Err(ChallengeError::Unsupported("dns-01"))
    }

    async fn remove_dns_record(&self, _: &str, _: &str, _: &str) -> Result<(), ChallengeError> {
        Err(ChallengeError::Unsupported("dns-01"))
    }
}

// ============================================================================
// DNS via shell commands
// ============================================================================

/// Runs operator-supplied commands to create and remove TXT records.
///
/// Commands see `WARDEN_DOMAIN`, `WARDEN_RECORD_NAME` and
/// `WARDEN_RECORD_VALUE` in their environment.
#[derive(Debug, Clone)]
pub struct ExecDnsResponder {
    present_command: String,
    cleanup_command: String,
    timeout: Duration,
}

impl ExecDnsResponder {
    pub fn new(
        present_command: impl Into<String>,
        cleanup_command: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            present_command: present_command.into(),
            cleanup_command: cleanup_command.into(),
            timeout,
        }
    }

    async fn run(
        &self,
        command: &str,
        domain: &str,
        name: &str,
        value: &str,
    ) -> Result<(), ChallengeError> {
        let envs = [
            ("WARDEN_DOMAIN", domain.to_string()),
            ("WARDEN_RECORD_NAME", name.to_string()),
            ("WARDEN_RECORD_VALUE", value.to_string()),
        ];

        let output = run_shell(command, &envs, self.timeout)
            .await
            .map_err(|e| match e {
                ShellError::Spawn(io) => ChallengeError::Io(io),
                ShellError::Timeout => ChallengeError::CommandTimeout {
                    command: command.to_string(),
                    after: self.timeout,
                },
            })?;

        if !output.status.success() {
            return Err(ChallengeError::CommandFailed {
                command: command.to_string(),
                status: output.status.to_string(),
                stderr: stderr_tail(&output),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChallengeResponder for ExecDnsResponder {
    async fn place_http_token(&self, _: &str, _: &str, _: &str) -> Result<(), ChallengeError> {
        Err(ChallengeError::Unsupported("http-01"))
    }

    async fn remove_http_token(&self, _: &str, _: &str) -> Result<(), ChallengeError> {
        Err(ChallengeError::Unsupported("http-01"))
    }

    async fn create_dns_record(
        &self,
        domain: &str,
        name: &str,
        value: &str,
    ) -> Result<(), ChallengeError> {
        self.run(&self.present_command, domain, name, value).await?;
        debug!(domain = %domain, record = %name, "Created DNS-01 TXT record");
        Ok(())
    }

    async fn remove_dns_record(
        &self,
        domain: &str,
        name: &str,
        value: &str,
    ) -> Result<(), ChallengeError> {
        self.run(&self.cleanup_command, domain, name, value).await?;
        debug!(domain = %domain, record = %name, "Removed DNS-01 TXT record");
        Ok(())
    }
}

// ============================================================================
// Routing
// ============================================================================

/// Routes HTTP-01 and DNS-01 calls to their configured responders
#[derive(Clone, Default)]
pub struct ResponderSet {
    http: Option<Arc<dyn ChallengeResponder>>,
    dns: Option<Arc<dyn ChallengeResponder>>,
}

impl ResponderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_http(mut self, responder: Arc<dyn ChallengeResponder>) -> Self {
        self.http = Some(responder);
        self
    }

    pub fn with_dns(mut self, responder: Arc<dyn ChallengeResponder>) -> Self {
        self.dns = Some(responder);
        self
    }

    fn http(&self) -> Result<&Arc<dyn ChallengeResponder>, ChallengeError> {
        self.http.as_ref().ok_or(ChallengeError::Unsupported("http-01"))
    }

    fn dns(&self) -> Result<&Arc<dyn ChallengeResponder>, ChallengeError> {
        self.dns.as_ref().ok_or(ChallengeError::Unsupported("dns-01"))
    }
}

impl std::fmt::Debug for ResponderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponderSet")
            .field("http", &self.http.is_some())
            .field("dns", &self.dns.is_some())
            .finish()
    }
}

#[async_trait]
impl ChallengeResponder for ResponderSet {
    async fn place_http_token(
        &self,
        domain: &str,
        token: &str,
        key_authorization: &str,
    ) -> Result<(), ChallengeError> {
        self.http()?
            .place_http_token(domain, token, key_authorization)
            .await
    }

    async fn remove_http_token(&self, domain: &str, token: &str) -> Result<(), ChallengeError> {
        self.http()?.remove_http_token(domain, token).await
    }

    async fn create_dns_record(
        &self,
        domain: &str,
        name: &str,
        value: &str,
    ) -> Result<(), ChallengeError> {
        self.dns()?.create_dns_record(domain, name, value).await
    }

    async fn remove_dns_record(
        &self,
        domain: &str,
        name: &str,
        value: &str,
    ) -> Result<(), ChallengeError> {
        self.dns()?.remove_dns_record(domain, name, value).await
    }
}
