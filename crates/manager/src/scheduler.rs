//! Background certificate renewal scheduler
//!
//! Periodically lists due certificates and hands each one to the
//! orchestrator as an independent job. Jobs for different certificates run
//! concurrently up to the pool size; jobs for the same certificate never
//! overlap.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use warden_common::CertificateId;

use crate::errors::LifecycleError;
use crate::metrics::Metrics;
use crate::orchestrator::{JobOutcome, Orchestrator};

/// Default check interval (12 hours)
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 3600);

/// Minimum check interval (1 minute)
const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Default number of concurrent jobs
const DEFAULT_POOL_SIZE: usize = 4;

/// Default grace period for hooks on shutdown
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// What one tick did
#[derive(Debug, Default)]
pub struct TickSummary {
    /// Records reported due by the store
    pub due: usize,
    /// Due records skipped because a job for them was still running
    pub busy: usize,
    pub outcomes: Vec<(CertificateId, JobOutcome)>,
    pub errors: Vec<(CertificateId, String)>,
}

impl TickSummary {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_success()).count()
    }
}

/// Background certificate renewal scheduler
pub struct RenewalScheduler {
    orchestrator: Arc<Orchestrator>,
    check_interval: Duration,
    pool: Arc<Semaphore>,
    pool_size: usize,
    /// Per-certificate job locks, the only state kept between ticks
    locks: DashMap<CertificateId, Arc<Mutex<()>>>,
    metrics: Option<Metrics>,
    textfile: Option<PathBuf>,
    shutdown_timeout: Duration,
}

impl RenewalScheduler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            check_interval: DEFAULT_CHECK_INTERVAL,
            pool: Arc::new(Semaphore::new(DEFAULT_POOL_SIZE)),
            pool_size: DEFAULT_POOL_SIZE,
            locks: DashMap::new(),
            metrics: None,
            textfile: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Set the check interval
    ///
    /// The interval is clamped to a minimum of 1 minute.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval.max(MIN_CHECK_INTERVAL);
        self
    }

    /// Bound the number of concurrent jobs (at least one)
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self.pool = Arc::new(Semaphore::new(self.pool_size));
        self
    }

    /// Export metrics, and write them to `textfile` after every tick
    pub fn with_metrics(mut self, metrics: Metrics, textfile: Option<PathBuf>) -> Self {
        self.metrics = Some(metrics);
        self.textfile = textfile;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    fn try_lock(&self, id: &CertificateId) -> Option<OwnedMutexGuard<()>> {
        let lock = self.locks.entry(id.clone()).or_default().clone();
        lock.try_lock_owned().ok()
    }

    /// Run the scheduler loop until `shutdown` is cancelled.
    ///
    /// Ticks immediately, then on every interval and whenever the earliest
    /// pending retry comes due. In-flight jobs are cancelled and awaited on
    /// shutdown, then challenge cleanup and dispatched hooks get a grace
    /// period.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            check_interval_secs = self.check_interval.as_secs(),
            pool_size = self.pool_size,
            "Starting certificate renewal scheduler"
        );

        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let retry_in = self.next_retry_delay();
            let retry_wakeup = async {
                match retry_in {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => debug!("Running scheduled certificate check"),
                _ = retry_wakeup => debug!("Woke up for pending retry"),
            }

            let summary = self.tick(&shutdown).await;
            if shutdown.is_cancelled() {
                break;
            }
            debug!(
                due = summary.due,
                succeeded = summary.succeeded(),
                busy = summary.busy,
                "Tick finished"
            );
        }

        info!("Certificate renewal scheduler stopping");
        if !self.orchestrator.drain(self.shutdown_timeout).await {
            warn!("Shutdown grace period elapsed with cleanup or hooks still running");
        }
    }

    fn next_retry_delay(&self) -> Option<Duration> {
        let now = self.orchestrator.clock().now();
        match self.orchestrator.store().next_wakeup(now) {
            Ok(next) => next.and_then(|at| (at - now).to_std().ok()),
            Err(e) => {
                warn!(error = %e, "Failed to compute next retry");
                None
            }
        }
    }

    /// Submit every due record and wait for the jobs to finish
    pub async fn tick(&self, cancel: &CancellationToken) -> TickSummary {
        let start = Instant::now();
        let now = self.orchestrator.clock().now();
        let mut summary = TickSummary::default();

        let due = match self
            .orchestrator
            .store()
            .list_due(now, self.orchestrator.horizon())
        {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Failed to list due certificates");
                return summary;
            }
        };
        summary.due = due.len();
        if !due.is_empty() {
            info!(due = due.len(), "Certificates due for issuance or renewal");
        }

        let mut jobs = JoinSet::new();
        for record in due {
            let Some(guard) = self.try_lock(&record.id) else {
                debug!(certificate_id = %record.id, "Job already running, skipping");
                summary.busy += 1;
                continue;
            };

            let orchestrator = self.orchestrator.clone();
            let pool = self.pool.clone();
            let cancel = cancel.clone();
            let id = record.id;

            jobs.spawn(async move {
                let _guard = guard;
                let permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return (id, Ok(JobOutcome::Cancelled)),
                    permit = pool.acquire_owned() => permit,
                };
                let Ok(_permit) = permit else {
                    return (id, Ok(JobOutcome::Skipped("worker pool closed")));
                };
                let result = orchestrator.process(&id, &cancel).await;
                (id, result)
            });
        }

        while let Some(joined) = jobs.join_next().await {
            match joined {
                Ok((id, Ok(outcome))) => {
                    debug!(certificate_id = %id, outcome = %outcome, "Job finished");
                    summary.outcomes.push((id, outcome));
                }
                Ok((id, Err(e))) => {
                    error!(certificate_id = %id, error = %e, "Job failed");
                    summary.errors.push((id, e.to_string()));
                }
                Err(e) => error!(error = %e, "Job panicked"),
            }
        }

        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        self.export_metrics(summary.due);

        if summary.due > 0 {
            info!(
                due = summary.due,
                succeeded = summary.succeeded(),
                errors = summary.errors.len(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Certificate check completed"
            );
        }
        summary
    }

    /// Run one job immediately, outside the tick.
    ///
    /// Shares the per-certificate lock with scheduled jobs.
    pub async fn run_now(
        &self,
        id: &CertificateId,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, LifecycleError> {
        let Some(_guard) = self.try_lock(id) else {
            return Ok(JobOutcome::Skipped("job already in flight"));
        };
        let _permit = self.pool.acquire().await;
        self.orchestrator.process(id, cancel).await
    }

    fn export_metrics(&self, due: usize) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        metrics.tick(due);
        match self.orchestrator.store().list() {
            Ok(records) => metrics.observe_records(&records),
            Err(e) => warn!(error = %e, "Failed to list records for metrics"),
        }
        if let Some(path) = &self.textfile {
            if let Err(e) = metrics.write_textfile(path) {
                warn!(path = %path.display(), error = %e, "Failed to write metrics textfile");
            }
        }
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("check_interval", &self.check_interval)
            .field("pool_size", &self.pool_size)
            .field("locks", &self.locks.len())
            .finish()
    }
}
