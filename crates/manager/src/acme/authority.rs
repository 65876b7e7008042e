//! Certificate authority protocol seam
//!
//! [`Authority`] and [`AuthorityOrder`] describe the handful of ACME
//! operations the client drives. [`InstantAcmeAuthority`] implements them
//! over `instant-acme`; tests substitute an in-process authority.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use warden_common::ChallengeKind;

use super::account::AccountStore;
use super::error::AcmeError;

/// Validation state of one identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationState {
    Pending,
    Valid,
    Invalid,
}

/// A challenge offered for an authorization
#[derive(Debug, Clone)]
pub struct ChallengeOffer {
    pub kind: ChallengeKind,
    pub token: String,
    pub url: String,
    /// HTTP-01 response body
    pub key_authorization: String,
    /// DNS-01 TXT record value
    pub dns_value: String,
}

/// Authorization for one identifier of an order
#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    pub domain: String,
    pub state: AuthorizationState,
    pub challenges: Vec<ChallengeOffer>,
}

impl PendingAuthorization {
    pub fn offer(&self, kind: ChallengeKind) -> Option<&ChallengeOffer> {
        self.challenges.iter().find(|c| c.kind == kind)
    }
}

/// Progress of a finalized order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderProgress {
    Processing,
    Issued(String),
}

/// An ACME directory the client can place orders with
#[async_trait]
pub trait Authority: Send + Sync {
    async fn new_order(&self, domains: &[String]) -> Result<Box<dyn AuthorityOrder>, AcmeError>;
}

/// One open order
#[async_trait]
pub trait AuthorityOrder: Send {
    async fn authorizations(&mut self) -> Result<Vec<PendingAuthorization>, AcmeError>;

    async fn set_challenge_ready(&mut self, url: &str) -> Result<(), AcmeError>;

    async fn finalize(&mut self, csr_der: &[u8]) -> Result<(), AcmeError>;

    /// Poll once for the issued chain
    async fn poll_certificate(&mut self) -> Result<OrderProgress, AcmeError>;
}

// ============================================================================
// Problem classification
// ============================================================================

const PROBLEM_PREFIX: &str = "urn:ietf:params:acme:error:";

/// Map an RFC 8555 problem document onto an error class
pub fn classify_problem(
    problem_type: Option<&str>,
    detail: Option<&str>,
    default_retry_after: Duration,
) -> AcmeError {
    let detail = detail.unwrap_or("no detail provided").to_string();
    let kind = problem_type
        .and_then(|t| t.strip_prefix(PROBLEM_PREFIX))
        .unwrap_or("");

    match kind {
        "rateLimited" => AcmeError::RateLimited {
            retry_after: parse_retry_after(&detail).unwrap_or(default_retry_after),
            detail,
        },
        "rejectedIdentifier" | "unsupportedIdentifier" | "caa" => AcmeError::InvalidDomain(detail),
        "connection" | "dns" | "incorrectResponse" | "tls" | "unauthorized" => {
            AcmeError::ChallengeFailed {
                domain: String::new(),
                detail,
            }
        }
        "badNonce" | "serverInternal" => AcmeError::AuthorityUnreachable(detail),
        _ => AcmeError::IssuanceFailed(format!(
            "{}: {}",
            problem_type.unwrap_or("unknown problem"),
            detail
        )),
    }
}

/// Extract the wait from Let's Encrypt's "retry after <UTC timestamp>" detail
pub fn parse_retry_after(detail: &str) -> Option<Duration> {
    let lower = detail.to_ascii_lowercase();
    let start = lower.find("retry after ")? + "retry after ".len();
    let stamp = detail.get(start..start + 19)?;
    let at = NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S")
        .ok()?
        .and_utc();
    (at - Utc::now()).to_std().ok()
}

fn map_error(err: instant_acme::Error, default_retry_after: Duration) -> AcmeError {
    match err {
        instant_acme::Error::Api(problem) => classify_problem(
            problem.r#type.as_deref(),
            problem.detail.as_deref(),
            default_retry_after,
        ),
        other => AcmeError::AuthorityUnreachable(other.to_string()),
    }
}

// ============================================================================
// instant-acme implementation
// ============================================================================

/// Authority backed by an `instant-acme` account.
///
/// The account is created (or loaded from stored credentials) on first use,
/// so commands that never talk to the CA do not need the network.
pub struct InstantAcmeAuthority {
    directory_url: String,
    contact_email: Option<String>,
    accounts: AccountStore,
    default_retry_after: Duration,
    account: OnceCell<Account>,
}

impl InstantAcmeAuthority {
    pub fn new(
        directory_url: impl Into<String>,
        contact_email: Option<String>,
        accounts: AccountStore,
        default_retry_after: Duration,
    ) -> Self {
        Self {
            directory_url: directory_url.into(),
            contact_email,
            accounts,
            default_retry_after,
            account: OnceCell::new(),
        }
    }

    async fn account(&self) -> Result<&Account, AcmeError> {
        self.account
            .get_or_try_init(|| self.load_or_create_account())
            .await
    }

    async fn load_or_create_account(&self) -> Result<Account, AcmeError> {
        let stored = self
            .accounts
            .load_credentials_json()
            .map_err(|e| AcmeError::AuthorityUnreachable(format!("account credentials: {}", e)))?;

        if let Some(json) = stored {
            let credentials: AccountCredentials = serde_json::from_str(&json).map_err(|e| {
                AcmeError::AuthorityUnreachable(format!("malformed account credentials: {}", e))
            })?;
            let account = Account::from_credentials(credentials)
                .await
                .map_err(|e| map_error(e, self.default_retry_after))?;
            debug!("Restored ACME account from stored credentials");
            return Ok(account);
        }

        let contact = self
            .contact_email
            .as_ref()
            .map(|email| format!("mailto:{}", email));
        let contacts: Vec<&str> = contact.iter().map(String::as_str).collect();

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contacts,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await
        .map_err(|e| map_error(e, self.default_retry_after))?;

        let json = serde_json::to_string_pretty(&credentials)
            .map_err(|e| AcmeError::IssuanceFailed(format!("serializing credentials: {}", e)))?;
        if let Err(e) = self.accounts.save_credentials_json(&json) {
            // The account works for this process; the next start registers again
            warn!(error = %e, "Failed to persist ACME account credentials");
        }

        info!(directory = %self.directory_url, "Created ACME account");
        Ok(account)
    }
}

impl std::fmt::Debug for InstantAcmeAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstantAcmeAuthority")
            .field("directory_url", &self.directory_url)
            .field("connected", &self.account.initialized())
            .finish()
    }
}

#[async_trait]
impl Authority for InstantAcmeAuthority {
    async fn new_order(&self, domains: &[String]) -> Result<Box<dyn AuthorityOrder>, AcmeError> {
        let account = self.account().await?;
        let identifiers: Vec<Identifier> =
            domains.iter().map(|d| Identifier::Dns(d.clone())).collect();

        let order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| map_error(e, self.default_retry_after))?;

        Ok(Box::new(InstantAcmeOrder {
            order,
            default_retry_after: self.default_retry_after,
        }))
    }
}

struct InstantAcmeOrder {
    order: Order,
    default_retry_after: Duration,
}

#[async_trait]
impl AuthorityOrder for InstantAcmeOrder {
    async fn authorizations(&mut self) -> Result<Vec<PendingAuthorization>, AcmeError> {
        let fallback = self.default_retry_after;
        let authorizations = self
            .order
            .authorizations()
            .await
            .map_err(|e| map_error(e, fallback))?;

        Ok(authorizations
            .iter()
            .map(|authz| {
                #[allow(unreachable_patterns)]
                let domain = match &authz.identifier {
                    Identifier::Dns(domain) => domain.clone(),
                    other => format!("{:?}", other),
                };
                let state = match authz.status {
                    AuthorizationStatus::Valid => AuthorizationState::Valid,
                    AuthorizationStatus::Pending => AuthorizationState::Pending,
                    _ => AuthorizationState::Invalid,
                };
                let challenges = authz
                    .challenges
                    .iter()
                    .filter_map(|challenge| {
                        let kind = match challenge.r#type {
                            ChallengeType::Http01 => ChallengeKind::Http01,
                            ChallengeType::Dns01 => ChallengeKind::Dns01,
                            _ => return None,
                        };
                        let key_authorization = self.order.key_authorization(challenge);
                        Some(ChallengeOffer {
                            kind,
                            token: challenge.token.clone(),
                            url: challenge.url.clone(),
                            key_authorization: key_authorization.as_str().to_string(),
                            dns_value: key_authorization.dns_value(),
                        })
                    })
                    .collect();

                PendingAuthorization {
                    domain,
                    state,
                    challenges,
                }
            })
            .collect())
    }

    async fn set_challenge_ready(&mut self, url: &str) -> Result<(), AcmeError> {
        let fallback = self.default_retry_after;
        self.order
            .set_challenge_ready(url)
            .await
            .map_err(|e| map_error(e, fallback))
    }

    async fn finalize(&mut self, csr_der: &[u8]) -> Result<(), AcmeError> {
        let fallback = self.default_retry_after;
        self.order
            .finalize(csr_der)
            .await
            .map_err(|e| map_error(e, fallback))
    }

    async fn poll_certificate(&mut self) -> Result<OrderProgress, AcmeError> {
        let fallback = self.default_retry_after;
        let ready = match &self
            .order
            .refresh()
            .await
            .map_err(|e| map_error(e, fallback))?
            .status
        {
            OrderStatus::Valid => true,
            OrderStatus::Invalid => {
                return Err(AcmeError::IssuanceFailed(
                    "order became invalid after finalization".to_string(),
                ))
            }
            _ => false,
        };
        if !ready {
            return Ok(OrderProgress::Processing);
        }

        match self
            .order
            .certificate()
            .await
            .map_err(|e| map_error(e, fallback))?
        {
            Some(chain) => Ok(OrderProgress::Issued(chain)),
            None => Ok(OrderProgress::Processing),
        }
    }
}
