//! Post-issuance hooks.
//!
//! After a certificate is committed `Active` the orchestrator hands every
//! configured hook to the [`HookRunner`], which runs it in a tracked
//! background task with retries. Hook outcomes are kept in memory for
//! status queries and never touch the certificate store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use warden_common::{CertificateId, Clock, DomainSet};
use warden_config::HookConfig;

use crate::errors::ErrorKind;
use crate::metrics::Metrics;
use crate::shell::{run_shell, stderr_tail, ShellError};

/// Delay before the first hook retry; doubled for each further retry
const DEFAULT_RETRY_BASE: Duration = Duration::from_secs(2);

/// A named hook command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookSpec {
    pub name: String,
    pub command: String,
    pub timeout: Duration,
    /// Attempts after the first failure
    pub retries: u32,
}

impl HookSpec {
    pub fn from_config(name: impl Into<String>, config: &HookConfig) -> Self {
        Self {
            name: name.into(),
            command: config.command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            retries: config.retries,
        }
    }
}

/// Certificate details exported to the hook environment
#[derive(Debug, Clone)]
pub struct HookContext {
    pub id: CertificateId,
    pub domains: DomainSet,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub not_after: Option<DateTime<Utc>>,
}

impl HookContext {
    fn env(&self) -> Vec<(&'static str, String)> {
        let path = |p: &Option<PathBuf>| {
            p.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        };

        vec![
            ("WARDEN_CERT_ID", self.id.to_string()),
            ("WARDEN_DOMAINS", self.domains.as_slice().join(" ")),
            ("WARDEN_CERT_PATH", path(&self.cert_path)),
            ("WARDEN_KEY_PATH", path(&self.key_path)),
            (
                "WARDEN_NOT_AFTER",
                self.not_after.map(|t| t.to_rfc3339()).unwrap_or_default(),
            ),
        ]
    }
}

/// Hook execution errors
#[derive(Debug, Error)]
pub enum HookError {
    #[error("Hook '{hook}' timed out after {}s", .after.as_secs())]
    Timeout { hook: String, after: Duration },

    #[error("Hook '{hook}' exited with {}: {stderr}", exit_status(.status))]
    NonZeroExit {
        hook: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("Hook '{hook}' could not be started: {source}")]
    Spawn {
        hook: String,
        #[source]
        source: std::io::Error,
    },
}

fn exit_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("status {}", code),
        None => "signal".to_string(),
    }
}

impl HookError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HookError::Timeout { .. } => ErrorKind::HookTimeout,
            HookError::NonZeroExit { .. } | HookError::Spawn { .. } => ErrorKind::HookNonZeroExit,
        }
    }
}

/// Outcome of the most recent run of one hook for one certificate
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HookReport {
    pub hook: String,
    pub attempts: u32,
    pub finished_at: DateTime<Utc>,
    /// `None` on success
    pub error_kind: Option<ErrorKind>,
    pub message: Option<String>,
}

impl HookReport {
    pub fn succeeded(&self) -> bool {
        self.error_kind.is_none()
    }
}

/// Runs hooks with retry and keeps their latest reports
#[derive(Clone)]
pub struct HookRunner {
    clock: Arc<dyn Clock>,
    metrics: Option<Metrics>,
    retry_base: Duration,
    reports: Arc<DashMap<CertificateId, Vec<HookReport>>>,
    tracker: TaskTracker,
}

impl HookRunner {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            metrics: None,
            retry_base: DEFAULT_RETRY_BASE,
            reports: Arc::new(DashMap::new()),
            tracker: TaskTracker::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Set the delay before the first retry
    pub fn with_retry_base(mut self, retry_base: Duration) -> Self {
        self.retry_base = retry_base;
        self
    }

    /// Run one hook to completion, retrying with doubling backoff
    pub async fn notify(&self, ctx: &HookContext, spec: &HookSpec) -> Result<(), HookError> {
        let env = ctx.env();
        let mut delay = self.retry_base;
        let mut attempt = 0;

        let result = loop {
            attempt += 1;
            match run_once(spec, &env).await {
                Ok(()) => break Ok(()),
                Err(e) if attempt <= spec.retries => {
                    warn!(
                        certificate_id = %ctx.id,
                        hook = %spec.name,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Hook failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(e) => break Err(e),
            }
        };

        match &result {
            Ok(()) => info!(
                certificate_id = %ctx.id,
                hook = %spec.name,
                attempts = attempt,
                "Hook completed"
            ),
            Err(e) => error!(
                certificate_id = %ctx.id,
                hook = %spec.name,
                attempts = attempt,
                error = %e,
                "Hook failed permanently"
            ),
        }

        self.record(ctx, spec, attempt, &result);
        result
    }

    /// Run every hook in the background. Returns immediately.
    pub fn dispatch(&self, ctx: HookContext, specs: Vec<HookSpec>) {
        if specs.is_empty() {
            return;
        }
        debug!(certificate_id = %ctx.id, hooks = specs.len(), "Dispatching hooks");

        let ctx = Arc::new(ctx);
        for spec in specs {
            let runner = self.clone();
            let ctx = ctx.clone();
            self.tracker.spawn(async move {
                // Outcome is already logged and reported.
                let _ = runner.notify(&ctx, &spec).await;
            });
        }
    }

    /// Latest report per hook for a certificate
    pub fn last_reports(&self, id: &CertificateId) -> Vec<HookReport> {
        self.reports
            .get(id)
            .map(|reports| reports.clone())
            .unwrap_or_default()
    }

    pub fn forget(&self, id: &CertificateId) {
        self.reports.remove(id);
    }

    /// Hooks still running
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for dispatched hooks, giving up after `grace`.
    ///
    /// Returns `false` if hooks were still running at the deadline.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.tracker.close();
        let drained = tokio::time::timeout(grace, self.tracker.wait())
            .await
            .is_ok();
        if !drained {
            warn!(
                remaining = self.tracker.len(),
                "Hooks still running at shutdown"
            );
        }
        self.tracker.reopen();
        drained
    }

    fn record(
        &self,
        ctx: &HookContext,
        spec: &HookSpec,
        attempts: u32,
        result: &Result<(), HookError>,
    ) {
        let report = HookReport {
            hook: spec.name.clone(),
            attempts,
            finished_at: self.clock.now(),
            error_kind: result.as_ref().err().map(HookError::kind),
            message: result.as_ref().err().map(ToString::to_string),
        };

        if let Some(metrics) = &self.metrics {
            metrics.hook_run(report.error_kind.map_or("ok", |k| k.as_str()));
        }

        let mut reports = self.reports.entry(ctx.id.clone()).or_default();
        reports.retain(|r| r.hook != report.hook);
        reports.push(report);
    }
}

impl std::fmt::Debug for HookRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRunner")
            .field("retry_base", &self.retry_base)
            .field("in_flight", &self.tracker.len())
            .finish()
    }
}

async fn run_once(spec: &HookSpec, env: &[(&'static str, String)]) -> Result<(), HookError> {
    match run_shell(&spec.command, env, spec.timeout).await {
        Ok(output) if output.status.success() => Ok(()),
        Ok(output) => Err(HookError::NonZeroExit {
            hook: spec.name.clone(),
            status: output.status.code(),
            stderr: stderr_tail(&output),
        }),
        Err(ShellError::Timeout) => Err(HookError::Timeout {
            hook: spec.name.clone(),
            after: spec.timeout,
        }),
        Err(ShellError::Spawn(source)) => Err(HookError::Spawn {
            hook: spec.name.clone(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_common::SystemClock;

    fn runner() -> HookRunner {
        HookRunner::new(Arc::new(SystemClock)).with_retry_base(Duration::from_millis(1))
    }

    fn ctx(dir: &std::path::Path) -> HookContext {
        HookContext {
            id: CertificateId::new("example.com"),
            domains: DomainSet::new(["example.com", "www.example.com"]).unwrap(),
            cert_path: Some(dir.join("cert.pem")),
            key_path: Some(dir.join("key.pem")),
            not_after: None,
        }
    }

    fn spec(command: &str, retries: u32) -> HookSpec {
        HookSpec {
            name: "reload".to_string(),
            command: command.to_string(),
            timeout: Duration::from_secs(5),
            retries,
        }
    }

    #[tokio::test]
    async fn test_hook_sees_certificate_env() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out");
        let command = format!(
            "printf '%s|%s|%s' \"$WARDEN_CERT_ID\" \"$WARDEN_DOMAINS\" \"$WARDEN_CERT_PATH\" > {}",
            out.display()
        );

        runner().notify(&ctx(dir.path()), &spec(&command, 0)).await.unwrap();

        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(
            written,
            format!(
                "example.com|example.com www.example.com|{}",
                dir.path().join("cert.pem").display()
            )
        );
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("count");
        // Fails on the first two runs, succeeds on the third.
        let command = format!(
            "echo x >> {c}; [ $(wc -l < {c}) -ge 3 ]",
            c = counter.display()
        );

        let runner = runner();
        runner.notify(&ctx(dir.path()), &spec(&command, 3)).await.unwrap();

        let reports = runner.last_reports(&CertificateId::new("example.com"));
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].attempts, 3);
        assert!(reports[0].succeeded());
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_non_zero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner();
        let err = runner
            .notify(&ctx(dir.path()), &spec("exit 7", 2))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::HookNonZeroExit);
        let reports = runner.last_reports(&CertificateId::new("example.com"));
        assert_eq!(reports[0].attempts, 3);
        assert_eq!(reports[0].error_kind, Some(ErrorKind::HookNonZeroExit));
    }

    #[tokio::test]
    async fn test_timeout_kind() {
        let dir = tempfile::tempdir().unwrap();
        let mut slow = spec("sleep 5", 0);
        slow.timeout = Duration::from_millis(50);

        let err = runner().notify(&ctx(dir.path()), &slow).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HookTimeout);
    }

    #[tokio::test]
    async fn test_dispatch_runs_in_background_and_drains() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("done");
        let runner = runner();

        runner.dispatch(
            ctx(dir.path()),
            vec![spec(&format!("touch {}", marker.display()), 0)],
        );
        assert!(runner.drain(Duration::from_secs(5)).await);
        assert!(marker.exists());
        assert_eq!(runner.in_flight(), 0);
    }
}
