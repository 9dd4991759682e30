//! Same-entity serialization on the shared write path: compare-and-write
//! misses, reload, and conflict exhaustion.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use common::t0;
use jobsync::broker::MemoryBroker;
use jobsync::clock::ManualClock;
use jobsync::engine::{ApplyOutcome, StatusWriter};
use jobsync::error::{Error, Result};
use jobsync::event::{self, EventReceiver, UpdateCause};
use jobsync::ingest::{Handled, Subscriber, SubscriberConfig};
use jobsync::model::{Decision, JobStatus, NewTrackedJob, SkipReason, StatusUpdate, TrackedJob};
use jobsync::store::{JobStore, MemoryStore};

/// Wraps the in-memory store. A queued rival update lands right before the
/// next compare-and-write, as if another handler won the race. With
/// `always_miss` every compare-and-write loses.
#[derive(Default)]
struct ContendedStore {
    inner: MemoryStore,
    rival: Mutex<Option<StatusUpdate>>,
    always_miss: bool,
    cas_calls: AtomicUsize,
}

impl ContendedStore {
    fn always_miss() -> Self {
        Self {
            always_miss: true,
            ..Self::default()
        }
    }

    fn race_with(&self, update: StatusUpdate) {
        *self.rival.lock().unwrap() = Some(update);
    }

    fn cas_calls(&self) -> usize {
        self.cas_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobStore for ContendedStore {
    async fn insert(&self, new: NewTrackedJob, now: DateTime<Utc>) -> Result<TrackedJob> {
        self.inner.insert(new, now).await
    }

    async fn find_by_entity_id(&self, entity_id: &str) -> Result<Option<TrackedJob>> {
        self.inner.find_by_entity_id(entity_id).await
    }

    async fn find_by_alternate_id(&self, alternate_id: &str) -> Result<Option<TrackedJob>> {
        self.inner.find_by_alternate_id(alternate_id).await
    }

    async fn list(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<TrackedJob>> {
        self.inner.list(status, limit).await
    }

    async fn find_stale(&self, cutoff: DateTime<Utc>, limit: i64) -> Result<Vec<TrackedJob>> {
        self.inner.find_stale(cutoff, limit).await
    }

    async fn compare_and_write(&self, expected: &TrackedJob, next: &TrackedJob) -> Result<bool> {
        self.cas_calls.fetch_add(1, Ordering::SeqCst);
        if self.always_miss {
            return Ok(false);
        }
        let rival = self.rival.lock().unwrap().take();
        if let Some(rival) = rival {
            let current = self.inner.get(&expected.entity_id).unwrap();
            if let Decision::Write(won) = current.plan_update(&rival, rival.timestamp.unwrap()) {
                self.inner.put(won);
            }
        }
        self.inner.compare_and_write(expected, next).await
    }
}

fn writer(store: Arc<ContendedStore>) -> (Arc<StatusWriter>, EventReceiver) {
    let (tx, rx) = event::channel(64);
    let clock = Arc::new(ManualClock::new(t0()));
    (Arc::new(StatusWriter::new(store, tx, clock)), rx)
}

fn at(secs: i64) -> DateTime<Utc> {
    t0() + chrono::Duration::seconds(secs)
}

async fn tracked(store: &ContendedStore, id: &str) {
    store.insert(NewTrackedJob::new(id), t0()).await.unwrap();
}

#[tokio::test]
async fn older_write_that_loses_the_race_is_skipped() {
    let store = Arc::new(ContendedStore::default());
    tracked(&store, "v1").await;
    let (writer, mut events) = writer(store.clone());

    store.race_with(StatusUpdate::new("v1", JobStatus::Active).progress(60).at(at(10)));
    let older = StatusUpdate::new("v1", JobStatus::Active).progress(30).at(at(5));
    let outcome = writer.apply(&older, UpdateCause::Executor).await.unwrap();

    assert_eq!(outcome, ApplyOutcome::Skipped(SkipReason::OutOfOrder));
    let job = store.inner.get("v1").unwrap();
    assert_eq!((job.progress, job.last_updated), (60, at(10)));
    assert_eq!(store.cas_calls(), 1);
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn newer_write_that_loses_the_race_is_replanned() {
    let store = Arc::new(ContendedStore::default());
    tracked(&store, "v1").await;
    let (writer, mut events) = writer(store.clone());

    store.race_with(StatusUpdate::new("v1", JobStatus::Active).progress(30).at(at(5)));
    let newer = StatusUpdate::new("v1", JobStatus::Active).progress(60).at(at(10));
    let outcome = writer.apply(&newer, UpdateCause::Executor).await.unwrap();

    assert!(matches!(outcome, ApplyOutcome::Applied(ref job) if job.progress == 60));
    let job = store.inner.get("v1").unwrap();
    assert_eq!((job.progress, job.last_updated), (60, at(10)));
    assert_eq!(store.cas_calls(), 2);
    assert_eq!(events.try_recv().unwrap().job.progress, 60);
}

#[tokio::test]
async fn equal_timestamp_plans_from_one_snapshot_cannot_both_land() {
    let store = MemoryStore::new();
    // Same instant as both plans, so only progress and stage tell them apart.
    let base = store.insert(NewTrackedJob::new("v1"), at(5)).await.unwrap();

    let plan = |progress: u8, stage: &str| {
        let update = StatusUpdate::new("v1", JobStatus::Active)
            .progress(progress)
            .stage(stage)
            .at(at(5));
        match base.plan_update(&update, at(5)) {
            Decision::Write(next) => next,
            Decision::Skip(reason) => panic!("unexpected skip: {reason:?}"),
        }
    };
    let first = plan(30, "extract");
    let second = plan(60, "encode");

    assert!(store.compare_and_write(&base, &first).await.unwrap());
    assert!(!store.compare_and_write(&base, &second).await.unwrap());
    let job = store.get("v1").unwrap();
    assert_eq!((job.progress, job.stage.as_deref()), (30, Some("extract")));
}

#[tokio::test]
async fn equal_timestamp_rival_forces_a_reload() {
    let store = Arc::new(ContendedStore::default());
    store.insert(NewTrackedJob::new("v1"), at(5)).await.unwrap();
    let (writer, _events) = writer(store.clone());

    store.race_with(
        StatusUpdate::new("v1", JobStatus::Active)
            .progress(60)
            .stage("encode")
            .at(at(5)),
    );
    let mine = StatusUpdate::new("v1", JobStatus::Active).progress(30).at(at(5));
    writer.apply(&mine, UpdateCause::Executor).await.unwrap();

    // Planned again against the rival's row, so its stage survives.
    let job = store.inner.get("v1").unwrap();
    assert_eq!((job.progress, job.stage.as_deref()), (30, Some("encode")));
    assert_eq!(store.cas_calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writes_for_one_job_keep_the_newest() {
    for _ in 0..50 {
        let store = Arc::new(ContendedStore::default());
        tracked(&store, "v1").await;
        let (writer, _events) = writer(store.clone());

        let handles: Vec<_> = [(5, 30u8), (10, 60), (7, 45)]
            .into_iter()
            .map(|(secs, progress)| {
                let writer = Arc::clone(&writer);
                tokio::spawn(async move {
                    let update = StatusUpdate::new("v1", JobStatus::Active)
                        .progress(progress)
                        .at(at(secs));
                    writer.apply(&update, UpdateCause::Executor).await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let job = store.inner.get("v1").unwrap();
        assert_eq!((job.progress, job.last_updated), (60, at(10)));
    }
}

#[tokio::test]
async fn exhausted_retries_surface_conflict_and_the_message_is_nacked() {
    let store = Arc::new(ContendedStore::always_miss());
    tracked(&store, "v1").await;
    let (writer, mut events) = writer(store.clone());

    let update = StatusUpdate::new("v1", JobStatus::Active).progress(10).at(at(1));
    let err = writer.apply(&update, UpdateCause::Executor).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(ref id) if id == "v1"));
    assert_eq!(store.cas_calls(), 5);

    let broker = Arc::new(MemoryBroker::new());
    let subscriber = Subscriber::new(
        broker.clone(),
        writer,
        SubscriberConfig {
            concurrency: 1,
            max_delivery_attempts: 3,
            poll_interval: Duration::from_millis(10),
        },
    );
    let msg_id = broker.publish(json!({"entityId": "v1", "status": "active", "progress": 10}));
    assert_eq!(subscriber.process_batch().await.unwrap(), vec![Handled::Nacked]);
    assert_eq!(broker.nacked(), vec![msg_id]);
    assert!(broker.acked().is_empty());
    assert!(events.try_recv().is_err());
}
