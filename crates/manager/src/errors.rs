//! Error taxonomy for the certificate lifecycle.
//!
//! Every failure that lands in a record's `last_attempt` is classified by
//! [`ErrorKind`]. The kind alone decides whether the scheduler may retry.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use warden_common::{CertificateId, DomainError};

use crate::acme::AcmeError;
use crate::record::CertificateState;

/// Classification of a lifecycle failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The authority rejected domain validation
    ChallengeFailed,
    /// A name in the certificate is malformed or refused by the authority
    InvalidDomain,
    /// The authority asked us to slow down
    RateLimited,
    /// Network failure or deadline exceeded talking to the authority
    AuthorityUnreachable,
    /// Validation passed but finalization or download failed
    IssuanceFailed,
    /// A post-issuance hook ran past its deadline
    HookTimeout,
    /// A post-issuance hook exited unsuccessfully
    HookNonZeroExit,
    /// Concurrent modification detected by the store
    ConflictError,
    /// Persisted key or chain is missing or unreadable
    ArtifactCorruption,
}

impl ErrorKind {
    /// Whether the scheduler may pick the record up again automatically
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited
                | ErrorKind::AuthorityUnreachable
                | ErrorKind::IssuanceFailed
                | ErrorKind::ConflictError
        )
    }

    /// Failures on the authority side of the protocol
    pub fn is_authority_side(&self) -> bool {
        matches!(
            self,
            ErrorKind::ChallengeFailed
                | ErrorKind::RateLimited
                | ErrorKind::AuthorityUnreachable
                | ErrorKind::IssuanceFailed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ChallengeFailed => "challenge_failed",
            ErrorKind::InvalidDomain => "invalid_domain",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::AuthorityUnreachable => "authority_unreachable",
            ErrorKind::IssuanceFailed => "issuance_failed",
            ErrorKind::HookTimeout => "hook_timeout",
            ErrorKind::HookNonZeroExit => "hook_non_zero_exit",
            ErrorKind::ConflictError => "conflict",
            ErrorKind::ArtifactCorruption => "artifact_corruption",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Certificate store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Certificate '{0}' not found")]
    NotFound(CertificateId),

    #[error("Version conflict on '{id}': expected {expected}, stored {actual}")]
    Conflict {
        id: CertificateId,
        expected: u64,
        actual: u64,
    },

    #[error("Artifact for '{id}' is missing or unreadable: {reason}")]
    ArtifactCorruption { id: CertificateId, reason: String },

    #[error("Certificate id '{0}' cannot be used as a storage key")]
    InvalidId(String),

    #[error("Storage is owned by another warden process (lock {})", .0.display())]
    Locked(std::path::PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            StoreError::Conflict { .. } => Some(ErrorKind::ConflictError),
            StoreError::ArtifactCorruption { .. } => Some(ErrorKind::ArtifactCorruption),
            _ => None,
        }
    }
}

/// Errors from orchestrator operations
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Certificate '{0}' not found")]
    NotFound(CertificateId),

    #[error("Certificate '{0}' is already registered")]
    AlreadyRegistered(CertificateId),

    #[error("Certificate '{id}' cannot {event} while {from}")]
    InvalidTransition {
        id: CertificateId,
        from: CertificateState,
        event: &'static str,
    },

    #[error("Certificate '{0}' was modified concurrently")]
    Conflict(CertificateId),

    #[error("Unknown hook '{0}'")]
    UnknownHook(String),

    #[error("Invalid domains: {0}")]
    Domain(#[from] DomainError),

    #[error("ACME error: {0}")]
    Acme(#[from] AcmeError),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for LifecycleError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => LifecycleError::NotFound(id),
            StoreError::Conflict { id, .. } => LifecycleError::Conflict(id),
            other => LifecycleError::Store(other),
        }
    }
}

impl LifecycleError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            LifecycleError::Conflict(_) => Some(ErrorKind::ConflictError),
            LifecycleError::Domain(_) => Some(ErrorKind::InvalidDomain),
            LifecycleError::Acme(e) => Some(e.kind()),
            LifecycleError::Store(e) => e.kind(),
            _ => None,
        }
    }
}
