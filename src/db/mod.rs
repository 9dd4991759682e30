//! Postgres handle: pool, migrations and the liveness probe behind `/health`.
//!
//! One pool serves both the entity store (`jobs`) and the pgmq broker
//! (`pgmq`).

pub mod jobs;
pub mod pgmq;

use std::time::{Duration, Instant};

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::debug;

use crate::error::{Error, Result};

const MAX_CONNECTIONS: u32 = 10;

/// A health check must answer well inside a load balancer's probe window.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Db {
    pool: PgPool,
}

impl Db {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Apply `migrations/` (the `tracked_jobs` table and its indexes).
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))
    }

    /// Round-trip a trivial query through the pool.
    pub async fn health_check(&self) -> Result<()> {
        let started = Instant::now();
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        debug!(
            latency_ms = started.elapsed().as_millis() as u64,
            idle = self.pool.num_idle(),
            "database reachable"
        );
        Ok(())
    }
}
