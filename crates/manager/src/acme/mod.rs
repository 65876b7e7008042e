//! ACME certificate issuance.
//!
//! [`AcmeAdapter`] is the seam the orchestrator talks to. The production
//! implementation is [`AcmeClient`], which drives an [`Authority`] (backed
//! by `instant-acme`) and publishes challenge answers through a
//! [`ChallengeResponder`].
//!
//! # Flow
//!
//! 1. Validate names locally
//! 2. Create an order and fetch its authorizations
//! 3. Publish answers for authorizations that are not yet valid
//! 4. Signal readiness and poll until validated
//! 5. Remove every published answer, also when the order is abandoned
//! 6. Finalize with a fresh CSR and download the chain

mod account;
mod authority;
mod challenge;
mod client;
mod error;

use std::time::Duration;

use async_trait::async_trait;

use warden_common::{ChallengeKind, DomainSet};

use crate::record::CertificateMaterial;

pub use account::AccountStore;
pub use authority::{
    classify_problem, parse_retry_after, Authority, AuthorityOrder, AuthorizationState,
    ChallengeOffer, InstantAcmeAuthority, OrderProgress, PendingAuthorization,
};
pub use challenge::{
    dns_record_name, ChallengeResponder, ExecDnsResponder, HttpTokenRegistry, ResponderSet,
    WebrootResponder, ACME_CHALLENGE_PREFIX,
};
pub use client::{leaf_validity, AcmeClient, ClientSettings};
pub use error::{AccountError, AcmeError, ChallengeError};

/// Issues certificates for a domain set
#[async_trait]
pub trait AcmeAdapter: Send + Sync {
    /// Run one complete order.
    ///
    /// Safe to call again for the same domains: authorizations the
    /// authority already holds as valid are reused.
    async fn request_certificate(
        &self,
        domains: &DomainSet,
        challenge: ChallengeKind,
    ) -> Result<CertificateMaterial, AcmeError>;

    /// Wait for background challenge cleanup left by abandoned orders.
    ///
    /// Returns `false` if cleanup was still running after `grace`.
    async fn drain(&self, _grace: Duration) -> bool {
        true
    }
}
