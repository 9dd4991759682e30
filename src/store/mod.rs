//! Entity store seam.
//!
//! The durable record of every tracked job. Postgres backs it in
//! production (`db::jobs`); [`memory::MemoryStore`] backs it in tests.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{JobStatus, NewTrackedJob, TrackedJob};

pub use memory::MemoryStore;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Register a job as `pending`. Fails if the entity id or alternate id
    /// is already taken.
    async fn insert(&self, new: NewTrackedJob, now: DateTime<Utc>) -> Result<TrackedJob>;

    async fn find_by_entity_id(&self, entity_id: &str) -> Result<Option<TrackedJob>>;

    async fn find_by_alternate_id(&self, alternate_id: &str) -> Result<Option<TrackedJob>>;

    /// Most recently updated first.
    async fn list(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<TrackedJob>>;

    /// Non-terminal jobs whose `last_updated` is older than `cutoff`,
    /// oldest first.
    async fn find_stale(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<TrackedJob>>;

    /// Replace `expected` with `next` if the stored row still equals
    /// `expected` in every mutable column.
    ///
    /// Returns `false` when another writer got there first.
    async fn compare_and_write(&self, expected: &TrackedJob, next: &TrackedJob) -> Result<bool>;

    /// Whether the backing store answers. In-memory stores always do.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
