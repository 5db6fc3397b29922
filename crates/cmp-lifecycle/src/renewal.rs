//! Renewal scheduler.
//!
//! Each tick first expires lapsed certificates, then submits a renewal for
//! every active certificate inside the renewal window that has no open
//! request and has not already been renewed.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cmp_core::error::{CmpError, CmpResult};
use cmp_core::metrics::MetricsSink;
use cmp_core::repository::{CertificateRepository, LifecycleStore};
use cmp_pki::AdapterResolver;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::RenewalConfig;
use crate::pipeline::IssuancePipeline;

/// Outcome of one scheduler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenewalReport {
    pub expired: usize,
    pub candidates: usize,
    /// Renewal requests created, by request id.
    pub scheduled: Vec<Uuid>,
    /// Candidates another actor claimed first.
    pub skipped: usize,
    pub failed: usize,
}

/// Periodically expires lapsed certificates and schedules renewals through
/// the pipeline.
pub struct RenewalScheduler<S: LifecycleStore, R: AdapterResolver> {
    store: Arc<S>,
    pipeline: IssuancePipeline<S, R>,
    metrics: Arc<dyn MetricsSink>,
    config: RenewalConfig,
}

impl<S: LifecycleStore, R: AdapterResolver> RenewalScheduler<S, R> {
    /// Build a scheduler submitting renewals through `pipeline`.
    pub fn new(
        store: Arc<S>,
        pipeline: IssuancePipeline<S, R>,
        metrics: Arc<dyn MetricsSink>,
        config: RenewalConfig,
    ) -> Self {
        Self {
            store,
            pipeline,
            metrics,
            config,
        }
    }

    /// Run one pass: expire, then schedule a renewal per candidate.
    ///
    /// Per-certificate failures are counted in the report, not returned.
    pub async fn tick(&self) -> CmpResult<RenewalReport> {
        let mut report = RenewalReport {
            expired: self.pipeline.expire_lapsed().await?,
            ..RenewalReport::default()
        };

        let cutoff = Utc::now() + self.config.window();
        let candidates = self
            .store
            .certificates()
            .list_renewal_candidates(cutoff, self.config.batch_size.max(1))
            .await?;
        report.candidates = candidates.len();

        for certificate in &candidates {
            match self.pipeline.schedule_renewal(certificate).await {
                Ok(request) => report.scheduled.push(request.id),
                Err(CmpError::Conflict { message }) => {
                    info!(certificate_id = %certificate.id, %message, "Renewal already claimed, skipping");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(certificate_id = %certificate.id, error = %e, "Failed to schedule renewal");
                    report.failed += 1;
                }
            }
        }

        self.metrics.increment("cmp_renewal_ticks_total", &[]);
        self.metrics.observe(
            "cmp_renewal_scheduled",
            report.scheduled.len() as f64,
            &[],
        );
        if report.candidates > 0 || report.expired > 0 {
            info!(
                candidates = report.candidates,
                scheduled = report.scheduled.len(),
                skipped = report.skipped,
                failed = report.failed,
                expired = report.expired,
                "Renewal tick complete"
            );
        }
        Ok(report)
    }

    /// Tick every `interval_secs` until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let period = Duration::from_secs(self.config.interval_secs.max(1));
        info!(
            interval_secs = period.as_secs(),
            window_days = self.config.window_days,
            "Renewal scheduler started"
        );
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Renewal tick failed");
                    }
                }
            }
        }
        info!("Renewal scheduler stopped");
    }
}
