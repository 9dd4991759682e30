//! Subscriber behavior end to end over the in-memory broker and store.

mod common;

use chrono::Duration;
use serde_json::json;

use common::Harness;
use jobsync::engine::ApplyOutcome;
use jobsync::event::UpdateCause;
use jobsync::ingest::Handled;
use jobsync::model::{JobStatus, NewTrackedJob, SkipReason};

fn ts(h: &Harness, secs: i64) -> String {
    (h.now() + Duration::seconds(secs)).to_rfc3339()
}

// ---------------------------------------------------------------------------
// Ordering and stickiness
// ---------------------------------------------------------------------------

#[tokio::test]
async fn older_event_never_regresses_progress() {
    let mut h = Harness::new();
    h.track(NewTrackedJob::new("v1").kind("video")).await;

    h.broker.publish(json!({
        "videoId": "v1", "status": "processing", "progress": 25, "timestamp": ts(&h, 20)
    }));
    let first = h.subscriber.process_batch().await.unwrap();
    assert!(matches!(first[0], Handled::Acked(ApplyOutcome::Applied(_))));

    h.broker.publish(json!({
        "videoId": "v1", "status": "processing", "progress": 10, "timestamp": ts(&h, 10)
    }));
    let second = h.subscriber.process_batch().await.unwrap();
    assert_eq!(
        second,
        vec![Handled::Acked(ApplyOutcome::Skipped(SkipReason::OutOfOrder))]
    );

    let job = h.job("v1");
    assert_eq!(job.status, JobStatus::Active);
    assert_eq!(job.progress, 25);
    assert_eq!(h.broker.acked().len(), 2);
    assert_eq!(h.drain_events().len(), 1);
}

#[tokio::test]
async fn completed_job_ignores_later_activity() {
    let mut h = Harness::new();
    h.track(NewTrackedJob::new("v2")).await;

    h.broker.publish(json!({
        "entityId": "v2", "status": "completed", "progress": 100, "timestamp": ts(&h, 10)
    }));
    h.broker.publish(json!({
        "entityId": "v2", "status": "active", "progress": 50, "timestamp": ts(&h, 20)
    }));
    h.subscriber.process_batch().await.unwrap();
    h.subscriber.process_batch().await.unwrap();

    let job = h.job("v2");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.progress, 100);
    assert_eq!(h.broker.acked().len(), 2);
    let events = h.drain_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].cause, UpdateCause::Executor);
}

#[tokio::test]
async fn reset_then_new_activity_is_accepted() {
    let h = Harness::new();
    h.track(NewTrackedJob::new("v2")).await;

    h.broker.publish(json!({"id": "v2", "status": "failed", "error": "gpu lost", "ts": ts(&h, 5)}));
    h.subscriber.process_batch().await.unwrap();
    assert_eq!(h.job("v2").error.as_deref(), Some("gpu lost"));

    h.advance_secs(10);
    h.writer
        .reset("v2", jobsync::engine::ResetKind::Reset)
        .await
        .unwrap();
    let reset = h.job("v2");
    assert_eq!(reset.status, JobStatus::Pending);
    assert_eq!(reset.retry_count, 0);
    assert_eq!(reset.error, None);

    h.broker.publish(json!({"id": "v2", "status": "running", "progress": 3, "ts": ts(&h, 1)}));
    h.subscriber.process_batch().await.unwrap();
    assert_eq!(h.job("v2").status, JobStatus::Active);
    assert_eq!(h.job("v2").progress, 3);
}

#[tokio::test]
async fn redelivered_message_is_idempotent() {
    let h = Harness::new();
    h.track(NewTrackedJob::new("v5")).await;
    let payload = json!({
        "entity_id": "v5", "state": "in progress", "progress_percent": "40%",
        "step": "embedding", "updated_at": ts(&h, 3)
    });

    h.broker.publish(payload.clone());
    h.subscriber.process_batch().await.unwrap();
    let once = h.job("v5");

    h.broker.publish(payload);
    h.subscriber.process_batch().await.unwrap();
    assert_eq!(h.job("v5"), once);
    assert_eq!(once.progress, 40);
    assert_eq!(once.stage.as_deref(), Some("embedding"));
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn alternate_id_resolves_to_the_tracked_job() {
    let h = Harness::new();
    h.track(NewTrackedJob::new("nb-7").alternate_id("kern-7").kind("kernel"))
        .await;

    h.broker.publish(json!({
        "data": {"kernel_id": "kern-7", "status": "provisioning", "phase": "pull-image"}
    }));
    h.subscriber.process_batch().await.unwrap();

    let job = h.job("nb-7");
    assert_eq!(job.status, JobStatus::Active);
    assert_eq!(job.stage.as_deref(), Some("pull-image"));
}

#[tokio::test]
async fn unknown_entity_is_acked_and_dropped() {
    let mut h = Harness::new();
    h.track(NewTrackedJob::new("v1")).await;

    h.broker.publish(json!({"videoId": "ghost", "status": "active"}));
    let settled = h.subscriber.process_batch().await.unwrap();

    assert_eq!(settled, vec![Handled::Acked(ApplyOutcome::Unresolved)]);
    assert_eq!(h.broker.acked().len(), 1);
    assert!(h.store.get("ghost").is_none());
    assert_eq!(h.job("v1").status, JobStatus::Pending);
    assert!(h.drain_events().is_empty());
}

// ---------------------------------------------------------------------------
// Malformed messages
// ---------------------------------------------------------------------------

#[tokio::test]
async fn malformed_message_is_retried_then_dead_lettered() {
    let h = Harness::new();
    let id = h.broker.publish(json!({"videoId": "v1", "status": "teleporting"}));

    assert_eq!(h.subscriber.process_batch().await.unwrap(), vec![Handled::Nacked]);
    assert_eq!(h.subscriber.process_batch().await.unwrap(), vec![Handled::Nacked]);
    assert_eq!(
        h.subscriber.process_batch().await.unwrap(),
        vec![Handled::DeadLettered]
    );

    assert_eq!(h.broker.nacked(), vec![id, id]);
    let dead = h.broker.dead_lettered();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].0, id);
    assert!(dead[0].1.contains("teleporting"));
    assert_eq!(h.broker.ready_len(), 0);
    assert_eq!(h.broker.in_flight_len(), 0);
}

#[tokio::test]
async fn run_drains_the_queue_and_stops_on_shutdown() {
    let h = Harness::new();
    for i in 0..10 {
        h.track(NewTrackedJob::new(format!("v{i}"))).await;
        h.broker
            .publish(json!({"videoId": format!("v{i}"), "status": "done"}));
    }

    let subscriber = h.subscriber.clone();
    let task = tokio::spawn(async move { subscriber.run().await });

    for _ in 0..200 {
        if h.broker.acked().len() == 10 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    h.subscriber.shutdown();
    task.await.unwrap().unwrap();

    assert_eq!(h.broker.acked().len(), 10);
    for i in 0..10 {
        assert_eq!(h.job(&format!("v{i}")).status, JobStatus::Completed);
        assert_eq!(h.job(&format!("v{i}")).progress, 100);
    }
}
