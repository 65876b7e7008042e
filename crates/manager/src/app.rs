//! Component wiring.
//!
//! Builds the store, ACME client, hook runner, orchestrator, scheduler and
//! operator from a loaded [`Config`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use warden_common::{span_from_secs, Clock, SystemClock};
use warden_config::Config;

use crate::acme::{
    AccountStore, AcmeAdapter, AcmeClient, ClientSettings, ExecDnsResponder, HttpTokenRegistry,
    InstantAcmeAuthority, ResponderSet, WebrootResponder,
};
use crate::hooks::{HookRunner, HookSpec};
use crate::errors::StoreError;
use crate::metrics::Metrics;
use crate::operator::Operator;
use crate::orchestrator::Orchestrator;
use crate::scheduler::RenewalScheduler;
use crate::store::{CertificateStore, FsCertificateStore};

/// Look-ahead used when checking stored chains at startup
const EXPIRY_WARNING_DAYS: i64 = 14;

/// Fully wired lifecycle manager
#[derive(Debug)]
pub struct App {
    config: Config,
    scheduler: Arc<RenewalScheduler>,
    operator: Operator,
    /// Token registry answering HTTP-01 when no webroot is configured
    http_tokens: Option<HttpTokenRegistry>,
    /// Whether this process may run jobs and recovery against the store
    owns_storage: bool,
}

impl App {
    /// Wire every component as the owner of the storage directory.
    ///
    /// Runs crash recovery. Fails with [`StoreError::Locked`] inside the
    /// error chain while another process owns the directory.
    pub fn from_config(config: Config) -> Result<Self> {
        Self::open(config, FsCertificateStore::open)
    }

    /// Wire every component next to a possibly running daemon. Recovery is
    /// left to the owner.
    pub fn from_config_shared(config: Config) -> Result<Self> {
        Self::open(config, FsCertificateStore::open_shared)
    }

    fn open(
        config: Config,
        open_store: fn(&std::path::Path) -> Result<FsCertificateStore, StoreError>,
    ) -> Result<Self> {
        let fs_store = open_store(&config.storage.path).with_context(|| {
            format!(
                "Failed to open certificate storage at {}",
                config.storage.path.display()
            )
        })?;
        let owns_storage = fs_store.is_owner();
        let store: Arc<dyn CertificateStore> = Arc::new(fs_store);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let (responders, http_tokens) = build_responders(&config);
        let authority = InstantAcmeAuthority::new(
            config.acme.directory_url(),
            config.acme.email.clone(),
            AccountStore::new(&config.storage.path),
            Duration::from_secs(config.acme.default_retry_after_secs),
        );
        let settings = ClientSettings {
            request_timeout: Duration::from_secs(config.acme.request_timeout_secs),
            poll_interval: Duration::from_secs(config.acme.poll_interval_secs),
            poll_attempts: config.acme.poll_attempts,
            dns_propagation: Duration::from_secs(config.acme.dns_propagation_secs),
        };
        let acme: Arc<dyn AcmeAdapter> = Arc::new(AcmeClient::new(
            Arc::new(authority),
            Arc::new(responders),
            settings,
        ));

        let mut app = Self::assemble(config, store, acme, clock, http_tokens)?;
        app.owns_storage = owns_storage;
        Ok(app)
    }

    /// Wire components around an existing store and ACME adapter
    pub fn assemble(
        config: Config,
        store: Arc<dyn CertificateStore>,
        acme: Arc<dyn AcmeAdapter>,
        clock: Arc<dyn Clock>,
        http_tokens: Option<HttpTokenRegistry>,
    ) -> Result<Self> {
        let metrics = Metrics::new().context("Failed to register metrics")?;
        let hooks = HookRunner::new(clock.clone()).with_metrics(metrics.clone());
        let hook_specs = config
            .hooks
            .iter()
            .map(|(name, hook)| HookSpec::from_config(name, hook));

        let orchestrator = Orchestrator::new(store, acme, hooks, clock)
            .with_hook_specs(hook_specs)
            .with_metrics(metrics.clone())
            .with_horizon(span_from_secs(config.scheduler.horizon_secs));

        let scheduler = Arc::new(
            RenewalScheduler::new(Arc::new(orchestrator))
                .with_interval(Duration::from_secs(config.scheduler.tick_interval_secs))
                .with_pool_size(config.scheduler.pool_size)
                .with_shutdown_timeout(Duration::from_secs(
                    config.scheduler.shutdown_timeout_secs,
                ))
                .with_metrics(metrics, config.metrics.textfile.clone()),
        );

        Ok(Self {
            operator: Operator::new(scheduler.clone()),
            scheduler,
            config,
            http_tokens,
            owns_storage: true,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn operator(&self) -> &Operator {
        &self.operator
    }

    pub fn scheduler(&self) -> &Arc<RenewalScheduler> {
        &self.scheduler
    }

    /// False when opened beside a running daemon
    pub fn owns_storage(&self) -> bool {
        self.owns_storage
    }

    pub fn http_tokens(&self) -> Option<&HttpTokenRegistry> {
        self.http_tokens.as_ref()
    }

    /// Wait for challenge cleanup and hooks left behind by finished jobs
    pub async fn drain(&self) -> bool {
        self.scheduler
            .orchestrator()
            .drain(Duration::from_secs(self.config.scheduler.shutdown_timeout_secs))
            .await
    }

    /// Run the daemon until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let report = self
            .operator
            .reconcile(&self.config)
            .context("Failed to register configured certificates")?;
        info!(
            registered = report.registered.len(),
            drifted = report.drifted.len(),
            "Configuration reconciled"
        );

        self.operator
            .check_artifacts(chrono::Duration::days(EXPIRY_WARNING_DAYS))
            .context("Failed to inspect stored certificates")?;

        self.scheduler.run(shutdown).await;
        Ok(())
    }
}

fn build_responders(config: &Config) -> (ResponderSet, Option<HttpTokenRegistry>) {
    let mut responders = ResponderSet::new();
    let mut http_tokens = None;

    match &config.acme.webroot {
        Some(webroot) => {
            responders = responders.with_http(Arc::new(WebrootResponder::new(webroot)));
        }
        None => {
            warn!("No webroot configured; HTTP-01 tokens are only served in-process");
            let registry = HttpTokenRegistry::new();
            responders = responders.with_http(Arc::new(registry.clone()));
            http_tokens = Some(registry);
        }
    }

    if let (Some(present), Some(cleanup)) = (&config.acme.dns_present, &config.acme.dns_cleanup) {
        responders = responders.with_dns(Arc::new(ExecDnsResponder::new(
            present.clone(),
            cleanup.clone(),
            Duration::from_secs(config.acme.request_timeout_secs),
        )));
    }

    (responders, http_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_creates_storage() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default_embedded().unwrap();
        config.storage.path = dir.path().join("state");
        config.acme.webroot = Some(dir.path().join("www"));

        let app = App::from_config(config).unwrap();
        assert!(app.owns_storage());
        assert!(dir.path().join("state/records").is_dir());
        assert!(app.http_tokens().is_none());
        assert!(app.operator().list().unwrap().is_empty());
    }

    #[test]
    fn test_shared_app_runs_beside_owner() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default_embedded().unwrap();
        config.storage.path = dir.path().to_path_buf();

        let _owner = App::from_config(config.clone()).unwrap();
        let err = App::from_config(config.clone()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StoreError>(),
            Some(StoreError::Locked(_))
        ));

        let shared = App::from_config_shared(config).unwrap();
        assert!(!shared.owns_storage());
        assert!(shared.operator().list().unwrap().is_empty());
    }

    #[test]
    fn test_in_process_tokens_without_webroot() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default_embedded().unwrap();
        config.storage.path = dir.path().to_path_buf();
        config.acme.webroot = None;

        let app = App::from_config(config).unwrap();
        assert_eq!(app.http_tokens().unwrap().pending_count(), 0);
    }
}
