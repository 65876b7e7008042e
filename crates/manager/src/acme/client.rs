//! ACME client: drives one order from creation to downloaded chain.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};
use x509_parser::pem::parse_x509_pem;

use warden_common::{validate_domain, ChallengeKind, DomainSet};

use super::authority::{
    Authority, AuthorityOrder, AuthorizationState, ChallengeOffer, OrderProgress,
    PendingAuthorization,
};
use super::challenge::{dns_record_name, ChallengeResponder};
use super::error::AcmeError;
use super::AcmeAdapter;
use crate::record::CertificateMaterial;

/// Timing knobs for the client
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Deadline for every single authority round trip
    pub request_timeout: Duration,
    /// Delay between validation and issuance polls
    pub poll_interval: Duration,
    /// Polls before giving up on validation or issuance
    pub poll_attempts: u32,
    /// Wait after creating DNS records before signalling readiness
    pub dns_propagation: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(2),
            poll_attempts: 30,
            dns_propagation: Duration::from_secs(30),
        }
    }
}

/// A challenge answer currently published by the responder
#[derive(Debug)]
enum PlacedChallenge {
    Http { domain: String, token: String },
    Dns { domain: String, name: String, value: String },
}

/// Answers published for one order.
///
/// [`release`](Self::release) removes them in place. If the order future is
/// dropped first, removal moves to a background task on the client's
/// tracker.
struct Published {
    responder: Arc<dyn ChallengeResponder>,
    cleanups: TaskTracker,
    placed: Vec<PlacedChallenge>,
}

impl Published {
    async fn release(mut self) {
        let placed = std::mem::take(&mut self.placed);
        remove_challenges(self.responder.as_ref(), placed).await;
    }
}

impl Drop for Published {
    fn drop(&mut self) {
        if self.placed.is_empty() {
            return;
        }
        let placed = std::mem::take(&mut self.placed);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(count = placed.len(), "Order abandoned, removing challenges in background");
                let responder = self.responder.clone();
                self.cleanups.spawn_on(
                    async move { remove_challenges(responder.as_ref(), placed).await },
                    &handle,
                );
            }
            Err(_) => warn!(
                challenges = ?placed,
                "Order abandoned outside the runtime, challenges left in place"
            ),
        }
    }
}

/// Remove every published answer. Failures are logged, never returned.
async fn remove_challenges(responder: &dyn ChallengeResponder, placed: Vec<PlacedChallenge>) {
    for challenge in placed {
        let result = match &challenge {
            PlacedChallenge::Http { domain, token } => {
                responder.remove_http_token(domain, token).await
            }
            PlacedChallenge::Dns {
                domain,
                name,
                value,
            } => responder.remove_dns_record(domain, name, value).await,
        };
        if let Err(e) = result {
            warn!(challenge = ?challenge, error = %e, "Failed to clean up challenge");
        }
    }
}

/// ACME client over any [`Authority`] and [`ChallengeResponder`]
pub struct AcmeClient {
    authority: Arc<dyn Authority>,
    responder: Arc<dyn ChallengeResponder>,
    settings: ClientSettings,
    /// Cleanup of orders dropped mid-flight
    cleanups: TaskTracker,
}

impl AcmeClient {
    pub fn new(
        authority: Arc<dyn Authority>,
        responder: Arc<dyn ChallengeResponder>,
        settings: ClientSettings,
    ) -> Self {
        Self {
            authority,
            responder,
            settings,
            cleanups: TaskTracker::new(),
        }
    }

    /// Background cleanups still running
    pub fn pending_cleanups(&self) -> usize {
        self.cleanups.len()
    }

    /// Bound one authority interaction by the request timeout
    async fn deadline<T, F>(&self, operation: &str, fut: F) -> Result<T, AcmeError>
    where
        F: Future<Output = Result<T, AcmeError>>,
    {
        match tokio::time::timeout(self.settings.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(AcmeError::AuthorityUnreachable(format!(
                "{} timed out after {}s",
                operation,
                self.settings.request_timeout.as_secs()
            ))),
        }
    }

    /// Publish answers for every pending authorization and wait for validation
    async fn complete_challenges(
        &self,
        order: &mut dyn AuthorityOrder,
        authorizations: Vec<PendingAuthorization>,
        kind: ChallengeKind,
        placed: &mut Vec<PlacedChallenge>,
    ) -> Result<(), AcmeError> {
        let mut ready_urls = Vec::new();

        for authz in &authorizations {
            match authz.state {
                AuthorizationState::Valid => {
                    debug!(domain = %authz.domain, "Reusing existing valid authorization");
                    continue;
                }
                AuthorizationState::Invalid => {
                    return Err(AcmeError::ChallengeFailed {
                        domain: authz.domain.clone(),
                        detail: "authorization is invalid".to_string(),
                    });
                }
                AuthorizationState::Pending => {}
            }

            let offer = authz.offer(kind).ok_or_else(|| AcmeError::ChallengeFailed {
                domain: authz.domain.clone(),
                detail: format!("authority offered no {} challenge", kind),
            })?;

            self.publish(&authz.domain, kind, offer, placed).await?;
            ready_urls.push(offer.url.clone());
        }

        if ready_urls.is_empty() {
            return Ok(());
        }

        if kind == ChallengeKind::Dns01 && !self.settings.dns_propagation.is_zero() {
            debug!(
                wait_secs = self.settings.dns_propagation.as_secs(),
                "Waiting for DNS propagation"
            );
            tokio::time::sleep(self.settings.dns_propagation).await;
        }

        for url in &ready_urls {
            self.deadline("challenge ready", order.set_challenge_ready(url))
                .await?;
        }

        self.wait_for_validation(order).await
    }

    async fn publish(
        &self,
        domain: &str,
        kind: ChallengeKind,
        offer: &ChallengeOffer,
        placed: &mut Vec<PlacedChallenge>,
    ) -> Result<(), AcmeError> {
        let failed = |e: super::error::ChallengeError| AcmeError::ChallengeFailed {
            domain: domain.to_string(),
            detail: format!("responder: {}", e),
        };

        match kind {
            ChallengeKind::Http01 => {
                self.responder
                    .place_http_token(domain, &offer.token, &offer.key_authorization)
                    .await
                    .map_err(failed)?;
                placed.push(PlacedChallenge::Http {
                    domain: domain.to_string(),
                    token: offer.token.clone(),
                });
            }
            ChallengeKind::Dns01 => {
                let name = dns_record_name(domain);
                self.responder
                    .create_dns_record(domain, &name, &offer.dns_value)
                    .await
                    .map_err(failed)?;
                placed.push(PlacedChallenge::Dns {
                    domain: domain.to_string(),
                    name,
                    value: offer.dns_value.clone(),
                });
            }
        }
        Ok(())
    }

    async fn wait_for_validation(&self, order: &mut dyn AuthorityOrder) -> Result<(), AcmeError> {
        for attempt in 1..=self.settings.poll_attempts {
            tokio::time::sleep(self.settings.poll_interval).await;

            let authorizations = self
                .deadline("authorization poll", order.authorizations())
                .await?;

            if let Some(invalid) = authorizations
                .iter()
                .find(|a| a.state == AuthorizationState::Invalid)
            {
                return Err(AcmeError::ChallengeFailed {
                    domain: invalid.domain.clone(),
                    detail: "authority rejected the challenge response".to_string(),
                });
            }

            if authorizations
                .iter()
                .all(|a| a.state == AuthorizationState::Valid)
            {
                debug!(attempt, "All authorizations valid");
                return Ok(());
            }

            trace!(attempt, "Authorizations still pending");
        }

        Err(AcmeError::AuthorityUnreachable(format!(
            "validation did not complete after {} polls",
            self.settings.poll_attempts
        )))
    }

    async fn wait_for_certificate(&self, order: &mut dyn AuthorityOrder) -> Result<String, AcmeError> {
        for attempt in 1..=self.settings.poll_attempts {
            match self
                .deadline("certificate poll", order.poll_certificate())
                .await?
            {
                OrderProgress::Issued(chain) => return Ok(chain),
                OrderProgress::Processing => {
                    trace!(attempt, "Order still processing");
                    tokio::time::sleep(self.settings.poll_interval).await;
                }
            }
        }

        Err(AcmeError::AuthorityUnreachable(format!(
            "certificate not issued after {} polls",
            self.settings.poll_attempts
        )))
    }
}

impl std::fmt::Debug for AcmeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcmeClient")
            .field("settings", &self.settings)
            .finish()
    }
}

#[async_trait]
impl AcmeAdapter for AcmeClient {
    async fn request_certificate(
        &self,
        domains: &DomainSet,
        challenge: ChallengeKind,
    ) -> Result<CertificateMaterial, AcmeError> {
        for domain in domains.iter() {
            validate_domain(domain)?;
        }
        if challenge == ChallengeKind::Http01 {
            if let Some(wildcard) = domains.iter().find(|d| d.starts_with("*.")) {
                return Err(AcmeError::InvalidDomain(format!(
                    "{} requires a dns-01 challenge",
                    wildcard
                )));
            }
        }

        let start = Instant::now();
        let mut order = self
            .deadline("new order", self.authority.new_order(domains.as_slice()))
            .await?;
        let authorizations = self
            .deadline("authorizations", order.authorizations())
            .await?;

        let mut published = Published {
            responder: self.responder.clone(),
            cleanups: self.cleanups.clone(),
            placed: Vec::new(),
        };
        let validated = self
            .complete_challenges(order.as_mut(), authorizations, challenge, &mut published.placed)
            .await;
        published.release().await;
        validated?;

        let (csr_der, key_pem) = build_csr(domains)?;
        self.deadline("finalize", order.finalize(&csr_der)).await?;
        let chain_pem = self.wait_for_certificate(order.as_mut()).await?;
        let (not_before, not_after) = leaf_validity(&chain_pem)?;

        info!(
            domains = ?domains.as_slice(),
            not_after = %not_after,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Certificate issued"
        );

        Ok(CertificateMaterial {
            chain_pem,
            key_pem,
            not_before,
            not_after,
        })
    }

    async fn drain(&self, grace: Duration) -> bool {
        self.cleanups.close();
        let drained = tokio::time::timeout(grace, self.cleanups.wait())
            .await
            .is_ok();
        if !drained {
            warn!(
                remaining = self.cleanups.len(),
                "Challenge cleanup still running at shutdown"
            );
        }
        self.cleanups.reopen();
        drained
    }
}

/// Fresh key pair and DER-encoded CSR for the domain set
fn build_csr(domains: &DomainSet) -> Result<(Vec<u8>, String), AcmeError> {
    let mut params = CertificateParams::new(domains.as_slice().to_vec())
        .map_err(|e| AcmeError::InvalidDomain(e.to_string()))?;
    params.distinguished_name = DistinguishedName::new();

    let key_pair =
        KeyPair::generate().map_err(|e| AcmeError::IssuanceFailed(format!("key generation: {}", e)))?;
    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| AcmeError::IssuanceFailed(format!("CSR: {}", e)))?;

    let csr_der: &[u8] = csr.der().as_ref();
    Ok((csr_der.to_vec(), key_pair.serialize_pem()))
}

/// Validity window of the leaf (first) certificate in a PEM chain
pub fn leaf_validity(chain_pem: &str) -> Result<(DateTime<Utc>, DateTime<Utc>), AcmeError> {
    let unusable = |reason: String| AcmeError::IssuanceFailed(format!("unusable chain: {}", reason));

    let (_, pem) = parse_x509_pem(chain_pem.as_bytes()).map_err(|e| unusable(e.to_string()))?;
    let cert = pem.parse_x509().map_err(|e| unusable(e.to_string()))?;
    let validity = cert.validity();

    let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
        .ok_or_else(|| unusable("notBefore out of range".to_string()))?;
    let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
        .ok_or_else(|| unusable("notAfter out of range".to_string()))?;
    Ok((not_before, not_after))
}
