//! In-memory entity store for tests and embedded use.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::JobStore;
use crate::error::{Error, Result};
use crate::model::{JobStatus, NewTrackedJob, TrackedJob};

/// Entity store held in a mutex-guarded map keyed by entity id.
#[derive(Default)]
pub struct MemoryStore {
    jobs: Mutex<HashMap<String, TrackedJob>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<String, TrackedJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Overwrite a row unconditionally. Test setup only.
    pub fn put(&self, job: TrackedJob) {
        self.jobs().insert(job.entity_id.clone(), job);
    }

    pub fn get(&self, entity_id: &str) -> Option<TrackedJob> {
        self.jobs().get(entity_id).cloned()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert(&self, new: NewTrackedJob, now: DateTime<Utc>) -> Result<TrackedJob> {
        let mut jobs = self.jobs();
        if jobs.contains_key(&new.entity_id) {
            return Err(Error::Other(format!("entity {} already tracked", new.entity_id)));
        }
        if let Some(ref alt) = new.alternate_id {
            if jobs.values().any(|j| j.alternate_id.as_deref() == Some(alt)) {
                return Err(Error::Other(format!("alternate id {alt} already tracked")));
            }
        }
        let job = new.into_job(now);
        jobs.insert(job.entity_id.clone(), job.clone());
        Ok(job)
    }

    async fn find_by_entity_id(&self, entity_id: &str) -> Result<Option<TrackedJob>> {
        Ok(self.jobs().get(entity_id).cloned())
    }

    async fn find_by_alternate_id(&self, alternate_id: &str) -> Result<Option<TrackedJob>> {
        Ok(self
            .jobs()
            .values()
            .find(|j| j.alternate_id.as_deref() == Some(alternate_id))
            .cloned())
    }

    async fn list(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<TrackedJob>> {
        let mut out: Vec<TrackedJob> = self
            .jobs()
            .values()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn find_stale(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<TrackedJob>> {
        let mut out: Vec<TrackedJob> = self
            .jobs()
            .values()
            .filter(|j| !j.status.is_terminal() && j.last_updated < cutoff)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.last_updated.cmp(&b.last_updated));
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn compare_and_write(&self, expected: &TrackedJob, next: &TrackedJob) -> Result<bool> {
        let mut jobs = self.jobs();
        let Some(current) = jobs.get_mut(&expected.entity_id) else {
            return Err(Error::NotFound(expected.entity_id.clone()));
        };
        // Whole-row match: two plans built from the same snapshot with equal
        // timestamps must not both land.
        if *current != *expected {
            return Ok(false);
        }
        *current = next.clone();
        Ok(true)
    }
}
