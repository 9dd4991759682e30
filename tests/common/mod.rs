//! Shared in-memory pipeline for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Semaphore;

use jobsync::broker::MemoryBroker;
use jobsync::clock::{Clock, ManualClock};
use jobsync::engine::{BackoffPolicy, RecordingScheduler, RetryController, StaleConfig, StaleLoop, StatusWriter};
use jobsync::error::{Error, Result};
use jobsync::event::{self, EventReceiver, JobEvent};
use jobsync::ingest::{Subscriber, SubscriberConfig};
use jobsync::model::{NewTrackedJob, TrackedJob};
use jobsync::remote::{RemoteAuthority, RemoteStatus};
use jobsync::store::{JobStore, MemoryStore};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

/// Remote authority with canned answers. Jobs it has not been told about
/// are `Unknown`.
#[derive(Default)]
pub struct ScriptedRemote {
    statuses: Mutex<HashMap<String, RemoteStatus>>,
    pub unreachable: AtomicBool,
    pub reject_retries: AtomicBool,
    retry_requests: Mutex<Vec<(String, u32)>>,
    pub status_calls: AtomicUsize,
    gate: Option<Semaphore>,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `status` call waits for a permit from [`ScriptedRemote::open`].
    pub fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Self::default()
        }
    }

    pub fn open(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn set(&self, remote_id: &str, status: RemoteStatus) {
        self.statuses
            .lock()
            .unwrap()
            .insert(remote_id.to_string(), status);
    }

    /// `(remote id, retry_count at request time)` for every retry requested.
    pub fn retry_requests(&self) -> Vec<(String, u32)> {
        self.retry_requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteAuthority for ScriptedRemote {
    async fn status(&self, job: &TrackedJob) -> Result<RemoteStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::Remote("connection refused".into()));
        }
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .get(job.remote_id())
            .cloned()
            .unwrap_or(RemoteStatus::Unknown))
    }

    async fn request_retry(&self, job: &TrackedJob) -> Result<()> {
        self.retry_requests
            .lock()
            .unwrap()
            .push((job.remote_id().to_string(), job.retry_count));
        if self.reject_retries.load(Ordering::SeqCst) {
            return Err(Error::Remote("executor refused the retry".into()));
        }
        Ok(())
    }
}

pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
    pub broker: Arc<MemoryBroker>,
    pub remote: Arc<ScriptedRemote>,
    pub scheduler: Arc<RecordingScheduler>,
    pub writer: Arc<StatusWriter>,
    pub retry: Arc<RetryController>,
    pub stale: Arc<StaleLoop>,
    pub subscriber: Subscriber,
    pub events: EventReceiver,
}

pub fn policy() -> BackoffPolicy {
    BackoffPolicy {
        initial: Duration::from_secs(5),
        max: Duration::from_secs(300),
        max_retries: 3,
    }
}

pub fn stale_config() -> StaleConfig {
    StaleConfig {
        interval: Duration::from_secs(60),
        timeout: Duration::from_secs(900),
        batch_limit: 100,
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_remote(ScriptedRemote::new())
    }

    pub fn with_remote(remote: ScriptedRemote) -> Self {
        Self::build(remote, SubscriberConfig {
            concurrency: 4,
            max_delivery_attempts: 3,
            poll_interval: Duration::from_millis(10),
        })
    }

    pub fn build(remote: ScriptedRemote, subscriber: SubscriberConfig) -> Self {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(MemoryStore::new());
        let broker = Arc::new(MemoryBroker::new());
        let remote = Arc::new(remote);
        let scheduler = Arc::new(RecordingScheduler::new());
        let (tx, events) = event::channel(1024);

        let writer = Arc::new(StatusWriter::new(store.clone(), tx, clock.clone()));
        let retry = Arc::new(RetryController::new(
            writer.clone(),
            remote.clone(),
            scheduler.clone(),
            policy(),
        ));
        let stale = Arc::new(StaleLoop::new(
            writer.clone(),
            remote.clone(),
            retry.clone(),
            stale_config(),
        ));
        let subscriber = Subscriber::new(broker.clone(), writer.clone(), subscriber);

        Self {
            clock,
            store,
            broker,
            remote,
            scheduler,
            writer,
            retry,
            stale,
            subscriber,
            events,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn advance_secs(&self, secs: i64) {
        self.clock.advance(chrono::Duration::seconds(secs));
    }

    pub async fn track(&self, new: NewTrackedJob) -> TrackedJob {
        self.store.insert(new, self.now()).await.unwrap()
    }

    pub fn job(&self, entity_id: &str) -> TrackedJob {
        self.store.get(entity_id).unwrap()
    }

    /// Everything emitted so far.
    pub fn drain_events(&mut self) -> Vec<JobEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}
