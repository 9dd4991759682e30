//! Tracked job record, status lifecycle, and the update planner.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use super::update::StatusUpdate;
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status of a tracked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Submitted (or reset), executor has not reported progress yet.
    Pending,
    /// Executor is working on it.
    Active,
    /// Done successfully. Terminal.
    Completed,
    /// Gave up or was lost. Terminal until reset.
    Failed,
}

impl JobStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Active)
                | (Pending, Completed)
                | (Pending, Failed)
                | (Active, Completed)
                | (Active, Failed)
                | (Completed, Pending) // reset
                | (Failed, Pending) // reset or retry
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "active" => Ok(JobStatus::Active),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::Other(format!("unknown job status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Tracked job
// ---------------------------------------------------------------------------

/// One status record per monitored piece of remote work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedJob {
    /// Primary key in the owning system.
    pub entity_id: String,
    /// Identifier the executor may use instead of `entity_id`.
    pub alternate_id: Option<String>,
    /// What kind of work this is (e.g. "video", "kernel").
    pub kind: String,
    pub status: JobStatus,
    /// 0..=100.
    pub progress: u8,
    pub stage: Option<String>,
    /// Only set while `status` is `failed`.
    pub error: Option<String>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last accepted write. Never moves backwards.
    pub last_updated: DateTime<Utc>,
}

/// Why an update was acknowledged without touching the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The event is older than the stored `last_updated`.
    OutOfOrder,
    /// The job is completed or failed; only a reset may change it.
    Terminal,
    /// The status change is not on the lifecycle graph (e.g. active -> pending).
    InvalidTransition { from: JobStatus, to: JobStatus },
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::OutOfOrder => "out_of_order",
            SkipReason::Terminal => "terminal",
            SkipReason::InvalidTransition { .. } => "invalid_transition",
        }
    }
}

/// Outcome of planning an update against the current record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Write this row in place of the current one.
    Write(TrackedJob),
    /// Leave the record as it is.
    Skip(SkipReason),
}

impl TrackedJob {
    /// The identifier the executor knows this job by.
    pub fn remote_id(&self) -> &str {
        self.alternate_id.as_deref().unwrap_or(&self.entity_id)
    }

    /// Decide what `update` does to this record.
    ///
    /// Pure: the caller performs the compare-and-write. Applying the same
    /// update to its own result yields the same row again.
    pub fn plan_update(&self, update: &StatusUpdate, received_at: DateTime<Utc>) -> Decision {
        if self.status.is_terminal() {
            return Decision::Skip(SkipReason::Terminal);
        }

        let timestamp = update.timestamp.unwrap_or(received_at).trunc_subsecs(6);
        if timestamp < self.last_updated {
            return Decision::Skip(SkipReason::OutOfOrder);
        }

        if update.status != self.status && !self.status.can_transition_to(update.status) {
            return Decision::Skip(SkipReason::InvalidTransition {
                from: self.status,
                to: update.status,
            });
        }

        let mut next = self.clone();
        next.status = update.status;
        next.progress = match (update.progress, update.status) {
            (Some(p), _) => p.min(100),
            (None, JobStatus::Completed) => 100,
            (None, _) => self.progress,
        };
        if update.stage.is_some() {
            next.stage = update.stage.clone();
        }
        next.error = if update.status == JobStatus::Failed {
            update.error.clone().or_else(|| self.error.clone())
        } else {
            None
        };
        next.last_updated = timestamp;
        Decision::Write(next)
    }

    /// Plan an explicit reset back to `pending`.
    ///
    /// Only valid from a terminal state. `bump_retry` is set for retries
    /// (automatic or manual) and increments `retry_count`.
    pub fn plan_reset(&self, now: DateTime<Utc>, bump_retry: bool) -> Result<TrackedJob> {
        if !self.status.is_terminal() {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: JobStatus::Pending,
            });
        }

        let mut next = self.clone();
        next.status = JobStatus::Pending;
        next.progress = 0;
        next.stage = None;
        next.error = None;
        if bump_retry {
            next.retry_count += 1;
        }
        next.last_updated = now.trunc_subsecs(6).max(self.last_updated);
        Ok(next)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for registering a job with the store. Used by the owning system
/// when it submits work; the pipeline itself never creates jobs.
#[derive(Debug, Clone)]
pub struct NewTrackedJob {
    pub(crate) entity_id: String,
    pub(crate) alternate_id: Option<String>,
    pub(crate) kind: String,
}

impl NewTrackedJob {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            alternate_id: None,
            kind: "generic".to_string(),
        }
    }

    pub fn alternate_id(mut self, id: impl Into<String>) -> Self {
        self.alternate_id = Some(id.into());
        self
    }

    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Materialize as a fresh `pending` row.
    pub fn into_job(self, now: DateTime<Utc>) -> TrackedJob {
        let now = now.trunc_subsecs(6);
        TrackedJob {
            entity_id: self.entity_id,
            alternate_id: self.alternate_id,
            kind: self.kind,
            status: JobStatus::Pending,
            progress: 0,
            stage: None,
            error: None,
            retry_count: 0,
            created_at: now,
            last_updated: now,
        }
    }
}
