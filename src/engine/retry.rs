//! Bounded exponential-backoff retries.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tracing::{info, warn};

use super::schedule::Scheduler;
use super::writer::{ApplyOutcome, ResetKind, StatusWriter};
use crate::error::{Error, Result};
use crate::event::UpdateCause;
use crate::model::{JobStatus, StatusUpdate, TrackedJob};
use crate::remote::RemoteAuthority;
use crate::telemetry::metrics;

/// Retry budget and delay curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
    /// Attempt budget per job. The original submission counts as the first
    /// attempt, so a job gets at most `max_retries - 1` automatic retries.
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(300),
            max_retries: 3,
        }
    }
}

impl BackoffPolicy {
    /// `initial * 2^retry_count`, capped at `max`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        2u32.checked_pow(retry_count)
            .and_then(|factor| self.initial.checked_mul(factor))
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Is there budget left for another automatic attempt?
    pub fn allows_retry(&self, retry_count: u32) -> bool {
        retry_count.saturating_add(1) < self.max_retries
    }
}

/// Re-issues lost work to the remote authority after a backoff delay.
pub struct RetryController {
    writer: Arc<StatusWriter>,
    remote: Arc<dyn RemoteAuthority>,
    scheduler: Arc<dyn Scheduler>,
    policy: BackoffPolicy,
}

impl RetryController {
    pub fn new(
        writer: Arc<StatusWriter>,
        remote: Arc<dyn RemoteAuthority>,
        scheduler: Arc<dyn Scheduler>,
        policy: BackoffPolicy,
    ) -> Self {
        Self {
            writer,
            remote,
            scheduler,
            policy,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Schedule an automatic retry of a failed job.
    ///
    /// Returns the delay, or `None` when the budget is spent and the job
    /// stays failed until someone resets it.
    pub fn schedule_retry(&self, job: &TrackedJob) -> Option<Duration> {
        if !self.policy.allows_retry(job.retry_count) {
            warn!(
                entity_id = %job.entity_id,
                retry_count = job.retry_count,
                max_retries = self.policy.max_retries,
                "retry budget exhausted, job stays failed"
            );
            metrics::retries().add(1, &[KeyValue::new("result", "exhausted")]);
            return None;
        }

        let delay = self.policy.delay_for(job.retry_count);
        let writer = Arc::clone(&self.writer);
        let remote = Arc::clone(&self.remote);
        let entity_id = job.entity_id.clone();

        info!(
            entity_id = %entity_id,
            retry_count = job.retry_count,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );
        metrics::retries().add(1, &[KeyValue::new("result", "scheduled")]);

        self.scheduler.schedule(
            delay,
            Box::pin(async move {
                if let Err(e) = attempt(&writer, remote.as_ref(), &entity_id).await {
                    // Left for the stale loop to pick up again.
                    warn!(entity_id = %entity_id, error = %e, "retry attempt failed");
                }
            }),
        );
        Some(delay)
    }

    /// Manual retry: same preconditions as a reset, bumps the retry count
    /// and asks the remote authority immediately. Ignores the budget.
    pub async fn retry_now(&self, entity_id: &str) -> Result<TrackedJob> {
        metrics::retries().add(1, &[KeyValue::new("result", "manual")]);
        attempt(&self.writer, self.remote.as_ref(), entity_id).await
    }
}

/// failed -> pending (retry_count + 1) -> remote retry -> active.
async fn attempt(
    writer: &StatusWriter,
    remote: &dyn RemoteAuthority,
    entity_id: &str,
) -> Result<TrackedJob> {
    let pending = writer.reset(entity_id, ResetKind::Retry).await?;
    remote.request_retry(&pending).await?;

    let started = StatusUpdate::new(entity_id, JobStatus::Active).at(writer.clock().now());
    match writer.apply(&started, UpdateCause::Retry).await? {
        ApplyOutcome::Applied(job) => {
            info!(entity_id, retry_count = job.retry_count, "retry issued");
            Ok(job)
        }
        // The executor reported first; keep whatever it said.
        ApplyOutcome::Skipped(_) | ApplyOutcome::Unresolved => writer
            .store()
            .find_by_entity_id(entity_id)
            .await?
            .ok_or_else(|| Error::NotFound(entity_id.to_string())),
    }
}
