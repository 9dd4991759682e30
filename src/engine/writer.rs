//! The single write path into the entity store.
//!
//! Subscriber, stale loop, retry controller and the reset endpoint all go
//! through [`StatusWriter`], so the ordering and stickiness rules live in
//! one place (`TrackedJob::plan_update`) and every accepted write emits
//! exactly one [`JobEvent`].

use std::sync::Arc;

use opentelemetry::KeyValue;
use tracing::{Span, debug, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::event::{EventSender, JobEvent, UpdateCause};
use crate::model::{Decision, SkipReason, StatusUpdate, TrackedJob};
use crate::store::JobStore;
use crate::telemetry::job::record_status_transition;
use crate::telemetry::metrics;

/// How many times a compare-and-write is retried against a fresh read
/// before the caller gets `Error::Conflict`.
const MAX_CAS_ATTEMPTS: usize = 5;

/// What happened to an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Written and broadcast.
    Applied(TrackedJob),
    /// No job matches any of the identifiers.
    Unresolved,
    /// Acknowledged without mutation.
    Skipped(SkipReason),
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Applied(_) => "applied",
            ApplyOutcome::Unresolved => "unresolved",
            ApplyOutcome::Skipped(reason) => reason.as_str(),
        }
    }
}

/// Whether a reset also counts as a retry attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    /// Plain reset: back to pending, retry count untouched.
    Reset,
    /// Retry: back to pending and `retry_count + 1`.
    Retry,
}

pub struct StatusWriter {
    store: Arc<dyn JobStore>,
    events: EventSender,
    clock: Arc<dyn Clock>,
}

impl StatusWriter {
    pub fn new(store: Arc<dyn JobStore>, events: EventSender, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            events,
            clock,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Find the job an update refers to: every candidate against the entity
    /// namespace first, then every candidate against the alternate namespace.
    pub async fn resolve(&self, identifiers: &[String]) -> Result<Option<TrackedJob>> {
        for id in identifiers {
            if let Some(job) = self.store.find_by_entity_id(id).await? {
                return Ok(Some(job));
            }
        }
        for id in identifiers {
            if let Some(job) = self.store.find_by_alternate_id(id).await? {
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    /// Apply a status update with compare-and-write, then emit the event.
    pub async fn apply(&self, update: &StatusUpdate, cause: UpdateCause) -> Result<ApplyOutcome> {
        let Some(mut current) = self.resolve(&update.identifiers).await? else {
            warn!(
                identifiers = ?update.identifiers,
                status = %update.status,
                "no tracked job for status update, dropping"
            );
            self.record(&ApplyOutcome::Unresolved);
            return Ok(ApplyOutcome::Unresolved);
        };

        for _ in 0..MAX_CAS_ATTEMPTS {
            let next = match current.plan_update(update, self.clock.now()) {
                Decision::Write(next) => next,
                Decision::Skip(reason) => {
                    debug!(
                        entity_id = %current.entity_id,
                        status = %current.status,
                        incoming = %update.status,
                        reason = reason.as_str(),
                        "status update skipped"
                    );
                    let outcome = ApplyOutcome::Skipped(reason);
                    self.record(&outcome);
                    return Ok(outcome);
                }
            };

            if self.store.compare_and_write(&current, &next).await? {
                if current.status != next.status {
                    record_status_transition(
                        &Span::current(),
                        &next.entity_id,
                        current.status.as_str(),
                        next.status.as_str(),
                    );
                } else {
                    debug!(entity_id = %next.entity_id, progress = next.progress, "progress updated");
                }
                self.emit(&next, cause).await;
                let outcome = ApplyOutcome::Applied(next);
                self.record(&outcome);
                return Ok(outcome);
            }

            current = self.reload(&current.entity_id).await?;
        }

        Err(Error::Conflict(current.entity_id))
    }

    /// Move a terminal job back to `pending`.
    pub async fn reset(&self, entity_id: &str, kind: ResetKind) -> Result<TrackedJob> {
        let mut current = self.reload(entity_id).await?;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let next = current.plan_reset(self.clock.now(), kind == ResetKind::Retry)?;
            if self.store.compare_and_write(&current, &next).await? {
                let cause = match kind {
                    ResetKind::Reset => UpdateCause::Reset,
                    ResetKind::Retry => UpdateCause::Retry,
                };
                debug!(
                    entity_id,
                    from = %current.status,
                    retry_count = next.retry_count,
                    ?kind,
                    "job reset to pending"
                );
                self.emit(&next, cause).await;
                return Ok(next);
            }
            current = self.reload(entity_id).await?;
        }

        Err(Error::Conflict(entity_id.to_string()))
    }

    /// Reachability of the store behind the write path.
    pub async fn health_check(&self) -> Result<()> {
        self.store.health_check().await
    }

    async fn reload(&self, entity_id: &str) -> Result<TrackedJob> {
        self.store
            .find_by_entity_id(entity_id)
            .await?
            .ok_or_else(|| Error::NotFound(entity_id.to_string()))
    }

    async fn emit(&self, job: &TrackedJob, cause: UpdateCause) {
        let event = JobEvent {
            job: job.clone(),
            cause,
        };
        if self.events.send(event).await.is_err() {
            // Gateway is gone (shutdown); the store write already stands.
            debug!(entity_id = %job.entity_id, "event channel closed, broadcast skipped");
        }
    }

    fn record(&self, outcome: &ApplyOutcome) {
        metrics::job_updates().add(1, &[KeyValue::new("outcome", outcome.as_str())]);
    }
}
