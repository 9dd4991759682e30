//! Tracked job persistence: the Postgres entity store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{JobStatus, NewTrackedJob, TrackedJob};
use crate::store::JobStore;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

const COLUMNS: &str = "entity_id, alternate_id, kind, status, progress, stage, error, retry_count, created_at, last_updated";

#[async_trait]
impl JobStore for super::Db {
    async fn insert(&self, new: NewTrackedJob, now: DateTime<Utc>) -> Result<TrackedJob> {
        let job = new.into_job(now);
        let row: TrackedJobRow = sqlx::query_as(&format!(
            "INSERT INTO tracked_jobs (entity_id, alternate_id, kind, status, progress, retry_count, created_at, last_updated)
             VALUES ($1, $2, $3, 'pending', 0, 0, $4, $4)
             RETURNING {COLUMNS}"
        ))
        .bind(&job.entity_id)
        .bind(&job.alternate_id)
        .bind(&job.kind)
        .bind(job.created_at)
        .fetch_one(&self.pool)
        .await?;
        row.try_into_job()
    }

    async fn find_by_entity_id(&self, entity_id: &str) -> Result<Option<TrackedJob>> {
        let row: Option<TrackedJobRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM tracked_jobs WHERE entity_id = $1"
        ))
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TrackedJobRow::try_into_job).transpose()
    }

    async fn find_by_alternate_id(&self, alternate_id: &str) -> Result<Option<TrackedJob>> {
        let row: Option<TrackedJobRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM tracked_jobs WHERE alternate_id = $1"
        ))
        .bind(alternate_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TrackedJobRow::try_into_job).transpose()
    }

    async fn list(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<TrackedJob>> {
        let rows: Vec<TrackedJobRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM tracked_jobs
             WHERE ($1::text IS NULL OR status = $1)
             ORDER BY last_updated DESC
             LIMIT $2"
        ))
        .bind(status.map(JobStatus::as_str))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TrackedJobRow::try_into_job).collect()
    }

    async fn find_stale(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<TrackedJob>> {
        let rows: Vec<TrackedJobRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM tracked_jobs
             WHERE status IN ('pending', 'active') AND last_updated < $1
             ORDER BY last_updated ASC
             LIMIT $2"
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TrackedJobRow::try_into_job).collect()
    }

    async fn compare_and_write(&self, expected: &TrackedJob, next: &TrackedJob) -> Result<bool> {
        // Single-statement compare-and-write; the WHERE clause is the
        // per-entity serialization point for overlapping handlers. It checks
        // every mutable column so equal-timestamp plans from the same
        // snapshot cannot both land.
        let rows_affected = sqlx::query(
            "UPDATE tracked_jobs
             SET status = $1, progress = $2, stage = $3, error = $4, retry_count = $5, last_updated = $6
             WHERE entity_id = $7 AND status = $8 AND last_updated = $9 AND retry_count = $10
               AND progress = $11 AND stage IS NOT DISTINCT FROM $12 AND error IS NOT DISTINCT FROM $13",
        )
        .bind(next.status.as_str())
        .bind(i16::from(next.progress))
        .bind(&next.stage)
        .bind(&next.error)
        .bind(next.retry_count as i32)
        .bind(next.last_updated)
        .bind(&expected.entity_id)
        .bind(expected.status.as_str())
        .bind(expected.last_updated)
        .bind(expected.retry_count as i32)
        .bind(i16::from(expected.progress))
        .bind(&expected.stage)
        .bind(&expected.error)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 1 && expected.status != next.status {
            metrics::job_state_transitions().add(
                1,
                &[
                    KeyValue::new("from", expected.status.as_str()),
                    KeyValue::new("to", next.status.as_str()),
                ],
            );
        }
        Ok(rows_affected == 1)
    }

    async fn health_check(&self) -> Result<()> {
        super::Db::health_check(self).await
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TrackedJobRow {
    entity_id: String,
    alternate_id: Option<String>,
    kind: String,
    status: String,
    progress: i16,
    stage: Option<String>,
    error: Option<String>,
    retry_count: i32,
    created_at: DateTime<Utc>,
    last_updated: DateTime<Utc>,
}

impl TrackedJobRow {
    fn try_into_job(self) -> Result<TrackedJob> {
        Ok(TrackedJob {
            entity_id: self.entity_id,
            alternate_id: self.alternate_id,
            kind: self.kind,
            status: self.status.parse()?,
            progress: self.progress.clamp(0, 100) as u8,
            stage: self.stage,
            error: self.error,
            retry_count: self.retry_count.max(0) as u32,
            created_at: self.created_at,
            last_updated: self.last_updated,
        })
    }
}
