//! Prometheus metrics for the lifecycle manager.
//!
//! Metrics live in a private [`Registry`] and are exported in the text
//! exposition format, optionally to a node-exporter textfile after every
//! scheduler tick.

use std::path::Path;

use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::{debug, warn};

use crate::record::{CertificateRecord, CertificateState};

/// Metric handles shared by the scheduler, orchestrator and hook runner
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    issuances: IntCounterVec,
    hook_runs: IntCounterVec,
    records: IntGaugeVec,
    ticks: IntCounter,
    due: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("warden".to_string()), None)?;

        let issuances = IntCounterVec::new(
            Opts::new("issuances_total", "Issuance and renewal attempts by outcome"),
            &["outcome"],
        )?;
        let hook_runs = IntCounterVec::new(
            Opts::new("hook_runs_total", "Hook executions by outcome"),
            &["outcome"],
        )?;
        let records = IntGaugeVec::new(
            Opts::new("certificates", "Managed certificates by state"),
            &["state"],
        )?;
        let ticks = IntCounter::new("scheduler_ticks_total", "Completed scheduler ticks")?;
        let due = IntGauge::new("certificates_due", "Certificates due at the last tick")?;

        registry.register(Box::new(issuances.clone()))?;
        registry.register(Box::new(hook_runs.clone()))?;
        registry.register(Box::new(records.clone()))?;
        registry.register(Box::new(ticks.clone()))?;
        registry.register(Box::new(due.clone()))?;

        Ok(Self {
            registry,
            issuances,
            hook_runs,
            records,
            ticks,
            due,
        })
    }

    /// Count one orchestrator job outcome (`issued`, `renewed`, `deferred`, ...)
    pub fn issuance(&self, outcome: &str) {
        self.issuances.with_label_values(&[outcome]).inc();
    }

    /// Count one hook run outcome (`ok`, `hook_timeout`, ...)
    pub fn hook_run(&self, outcome: &str) {
        self.hook_runs.with_label_values(&[outcome]).inc();
    }

    pub fn tick(&self, due: usize) {
        self.ticks.inc();
        self.due.set(due as i64);
    }

    /// Refresh the per-state gauges from a full listing
    pub fn observe_records(&self, records: &[CertificateRecord]) {
        for state in CertificateState::ALL {
            let count = records.iter().filter(|r| r.state == state).count();
            self.records
                .with_label_values(&[state.as_str()])
                .set(count as i64);
        }
    }

    /// Text exposition of every metric
    pub fn render(&self) -> String {
        match TextEncoder::new().encode_to_string(&self.registry.gather()) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to encode metrics");
                String::new()
            }
        }
    }

    /// Atomically replace a node-exporter textfile
    pub fn write_textfile(&self, path: &Path) -> std::io::Result<()> {
        crate::store::write_atomic(path, self.render().as_bytes(), 0o644)?;
        debug!(path = %path.display(), "Wrote metrics textfile");
        Ok(())
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use warden_common::{ChallengeKind, DomainSet, RenewalPolicy};

    #[test]
    fn test_render_contains_counters_and_states() {
        let metrics = Metrics::new().unwrap();
        metrics.issuance("issued");
        metrics.issuance("issued");
        metrics.hook_run("hook_timeout");
        metrics.tick(3);

        let record = CertificateRecord::new(
            DomainSet::new(["example.com"]).unwrap(),
            RenewalPolicy::default(),
            ChallengeKind::Http01,
            Vec::new(),
            Utc::now(),
        );
        metrics.observe_records(&[record]);

        let text = metrics.render();
        assert!(text.contains("warden_issuances_total{outcome=\"issued\"} 2"));
        assert!(text.contains("warden_hook_runs_total{outcome=\"hook_timeout\"} 1"));
        assert!(text.contains("warden_certificates{state=\"pending\"} 1"));
        assert!(text.contains("warden_certificates{state=\"active\"} 0"));
        assert!(text.contains("warden_certificates_due 3"));
    }

    #[test]
    fn test_write_textfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.prom");
        let metrics = Metrics::new().unwrap();
        metrics.tick(0);
        metrics.write_textfile(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("warden_scheduler_ticks_total 1"));
    }
}
