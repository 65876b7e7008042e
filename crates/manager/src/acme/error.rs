//! ACME error types

use std::time::Duration;

use thiserror::Error;

use warden_common::DomainError;

use crate::errors::ErrorKind;

/// Outcome classes of a failed certificate request
#[derive(Debug, Clone, Error)]
pub enum AcmeError {
    #[error("Challenge for '{domain}' failed: {detail}")]
    ChallengeFailed { domain: String, detail: String },

    #[error("Invalid domain: {0}")]
    InvalidDomain(String),

    #[error("Rate limited for {}s: {detail}", retry_after.as_secs())]
    RateLimited { retry_after: Duration, detail: String },

    #[error("Authority unreachable: {0}")]
    AuthorityUnreachable(String),

    #[error("Issuance failed: {0}")]
    IssuanceFailed(String),
}

impl AcmeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AcmeError::ChallengeFailed { .. } => ErrorKind::ChallengeFailed,
            AcmeError::InvalidDomain(_) => ErrorKind::InvalidDomain,
            AcmeError::RateLimited { .. } => ErrorKind::RateLimited,
            AcmeError::AuthorityUnreachable(_) => ErrorKind::AuthorityUnreachable,
            AcmeError::IssuanceFailed(_) => ErrorKind::IssuanceFailed,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AcmeError::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

impl From<DomainError> for AcmeError {
    fn from(err: DomainError) -> Self {
        AcmeError::InvalidDomain(err.to_string())
    }
}

/// Challenge responder errors
#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("No responder configured for {0} challenges")]
    Unsupported(&'static str),

    #[error("Command '{command}' failed with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Command '{command}' timed out after {}s", after.as_secs())]
    CommandTimeout { command: String, after: Duration },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Account credential persistence errors
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed credentials: {0}")]
    Serialization(#[from] serde_json::Error),
}
