//! Stale job detection.
//!
//! Jobs that sit in `pending`/`active` past the timeout are checked against
//! the remote authority. Divergence is written back through the shared
//! [`StatusWriter`] path; jobs the remote has lost are failed and handed to
//! the [`RetryController`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::retry::RetryController;
use super::writer::{ApplyOutcome, StatusWriter};
use crate::error::Result;
use crate::event::UpdateCause;
use crate::model::{JobStatus, StatusUpdate, TrackedJob};
use crate::remote::{RemoteAuthority, RemoteStatus};
use crate::telemetry::metrics;

#[derive(Debug, Clone)]
pub struct StaleConfig {
    /// Time between cycles.
    pub interval: Duration,
    /// How long a non-terminal job may go without an update.
    pub timeout: Duration,
    /// Max jobs examined per cycle.
    pub batch_limit: i64,
}

impl Default for StaleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(900),
            batch_limit: 100,
        }
    }
}

/// Tally of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub examined: usize,
    /// Remote says it is still running; progress refreshed.
    pub refreshed: usize,
    /// Remote reported a terminal state; written back.
    pub reconciled: usize,
    /// Lost remotely, failed, retry scheduled.
    pub retried: usize,
    /// Lost remotely, failed, no budget left.
    pub exhausted: usize,
    /// Remote could not be asked; left as is.
    pub unreachable: usize,
    /// Someone else wrote the row between our read and our write.
    pub raced: usize,
    pub errors: usize,
}

enum Step {
    Refreshed,
    Reconciled,
    Retried,
    Exhausted,
    Unreachable,
    Raced,
}

pub struct StaleLoop {
    writer: Arc<StatusWriter>,
    remote: Arc<dyn RemoteAuthority>,
    retry: Arc<RetryController>,
    config: StaleConfig,
    running: AtomicBool,
}

/// Clears the in-flight flag however the cycle ends.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl StaleLoop {
    pub fn new(
        writer: Arc<StatusWriter>,
        remote: Arc<dyn RemoteAuthority>,
        retry: Arc<RetryController>,
        config: StaleConfig,
    ) -> Self {
        Self {
            writer,
            remote,
            retry,
            config,
            running: AtomicBool::new(false),
        }
    }

    /// Run cycles on the configured interval until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_secs = self.config.interval.as_secs(),
            timeout_secs = self.config.timeout.as_secs(),
            "stale loop started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("stale loop stopping");
                    break;
                }
                _ = interval.tick() => {
                    if let Some(report) = self.run_cycle().await {
                        if report.examined > 0 {
                            info!(?report, "stale cycle finished");
                        } else {
                            debug!("stale cycle: nothing overdue");
                        }
                    }
                }
            }
        }
    }

    /// Run one cycle. Returns `None` without doing anything if another
    /// cycle is still in flight.
    pub async fn run_cycle(&self) -> Option<CycleReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("stale cycle still running, skipping this tick");
            return None;
        }
        let _guard = FlightGuard(&self.running);
        let started = Instant::now();
        let report = self.cycle().await;
        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", "stale.cycle")],
        );
        Some(report)
    }

    async fn cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();
        let timeout = chrono::Duration::seconds(self.config.timeout.as_secs() as i64);
        let cutoff = self.writer.clock().now() - timeout;

        let overdue = match self
            .writer
            .store()
            .find_stale(cutoff, self.config.batch_limit)
            .await
        {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "stale scan failed");
                report.errors += 1;
                return report;
            }
        };

        for job in overdue {
            report.examined += 1;
            match self.reconcile(&job).await {
                Ok(step) => {
                    let counter = match step {
                        Step::Refreshed => &mut report.refreshed,
                        Step::Reconciled => &mut report.reconciled,
                        Step::Retried => &mut report.retried,
                        Step::Exhausted => &mut report.exhausted,
                        Step::Unreachable => &mut report.unreachable,
                        Step::Raced => &mut report.raced,
                    };
                    *counter += 1;
                }
                Err(e) => {
                    warn!(entity_id = %job.entity_id, error = %e, "stale reconcile failed");
                    report.errors += 1;
                }
            }
        }

        for (outcome, n) in [
            ("refreshed", report.refreshed),
            ("reconciled", report.reconciled),
            ("retried", report.retried),
            ("exhausted", report.exhausted),
            ("unreachable", report.unreachable),
        ] {
            if n > 0 {
                metrics::stale_jobs().add(n as u64, &[KeyValue::new("outcome", outcome)]);
            }
        }
        report
    }

    async fn reconcile(&self, job: &TrackedJob) -> Result<Step> {
        let remote = match self.remote.status(job).await {
            Ok(status) => status,
            Err(e) => {
                // Try again next cycle; no escalation.
                warn!(entity_id = %job.entity_id, error = %e, "remote authority unreachable");
                return Ok(Step::Unreachable);
            }
        };

        let now = self.writer.clock().now();
        let base = |status| StatusUpdate::new(job.entity_id.clone(), status).at(now);

        let (update, step) = match remote {
            RemoteStatus::Running { progress } => {
                let mut update = base(JobStatus::Active);
                update.progress = progress;
                (update, Step::Refreshed)
            }
            RemoteStatus::Completed => (base(JobStatus::Completed), Step::Reconciled),
            RemoteStatus::Failed(reason) => (base(JobStatus::Failed).error(reason), Step::Reconciled),
            RemoteStatus::Unknown => {
                let reason = if self.retry.policy().allows_retry(job.retry_count) {
                    format!(
                        "timed out after {}s in {} with no record on the executor",
                        self.config.timeout.as_secs(),
                        job.status
                    )
                } else {
                    format!(
                        "timed out with no record on the executor; retry budget exhausted after {} attempts",
                        job.retry_count + 1
                    )
                };
                (base(JobStatus::Failed).error(reason), Step::Retried)
            }
        };

        match self.writer.apply(&update, UpdateCause::Reconciled).await? {
            ApplyOutcome::Applied(written) => match step {
                Step::Retried => match self.retry.schedule_retry(&written) {
                    Some(_) => Ok(Step::Retried),
                    None => Ok(Step::Exhausted),
                },
                other => Ok(other),
            },
            ApplyOutcome::Skipped(_) | ApplyOutcome::Unresolved => Ok(Step::Raced),
        }
    }
}
