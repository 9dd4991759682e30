//! Observer-side reconciliation: registration, eviction and restart
//! recovery against the authoritative store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use common::Harness;
use jobsync::client::{ClientApply, ClientCache, ClientConfig, ClientState, ClientUpdate};
use jobsync::clock::{Clock, ManualClock};
use jobsync::event::{BroadcastMessage, UpdateCause};
use jobsync::model::{JobStatus, NewTrackedJob, StatusUpdate};
use jobsync::store::JobStore;

fn config() -> ClientConfig {
    ClientConfig {
        grace: Duration::from_secs(5),
        stale_after: Duration::from_secs(3600),
        sweep_interval: Duration::from_secs(30),
    }
}

#[test]
fn update_for_unregistered_job_is_ignored() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mut state = ClientState::new(config(), clock.clone());
    state.register("v3", JobStatus::Pending);
    let before = state.get("v3").cloned();

    let job = NewTrackedJob::new("v4").into_job(clock.now());
    let msg = BroadcastMessage {
        job,
        server_timestamp: Utc::now(),
    };
    assert_eq!(
        state.apply_update(&ClientUpdate::from(&msg)),
        ClientApply::Unregistered
    );
    assert_eq!(state.len(), 1);
    assert_eq!(state.get("v3").cloned(), before);
    assert!(state.get("v4").is_none());
}

#[test]
fn sweep_evicts_finished_and_abandoned_entries() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let mut state = ClientState::new(config(), clock.clone());
    state.register("done", JobStatus::Active);
    state.register("abandoned", JobStatus::Active);
    state.register("busy", JobStatus::Active);

    clock.advance(chrono::Duration::seconds(3599));
    state.apply_update(&ClientUpdate {
        entity_id: "done".into(),
        status: Some(JobStatus::Completed),
        ..ClientUpdate::default()
    });
    state.apply_update(&ClientUpdate {
        entity_id: "busy".into(),
        progress: Some(50),
        ..ClientUpdate::default()
    });

    // "abandoned" passes the staleness threshold; "done" is still in grace.
    clock.advance(chrono::Duration::seconds(2));
    assert_eq!(state.sweep(), vec!["abandoned".to_string()]);
    assert_eq!(state.get("done").unwrap().status, JobStatus::Completed);

    clock.advance(chrono::Duration::seconds(5));
    assert_eq!(state.sweep(), vec!["done".to_string()]);
    assert_eq!(state.active_ids(), vec!["busy".to_string()]);
}

/// Observer restarts: cached entries come back, stale ones are discarded,
/// and the rest are brought in line with the store.
#[tokio::test]
async fn restart_reloads_cache_and_resynchronizes() {
    let h = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let cache = ClientCache::new(dir.path().join("observer.json"));

    for id in ["v1", "v2", "old"] {
        h.track(NewTrackedJob::new(id)).await;
    }

    // First session.
    {
        let mut state = ClientState::new(config(), h.clock.clone());
        state.register("old", JobStatus::Pending);
        h.advance_secs(3000);
        state.register("v1", JobStatus::Pending);
        state.register("v2", JobStatus::Pending);
        state.register("gone", JobStatus::Pending);
        cache.save(&state.snapshot(), h.now()).await.unwrap();
    }

    // While disconnected, the executor moves on.
    h.advance_secs(700);
    let done = StatusUpdate::new("v1", JobStatus::Completed).at(h.now());
    h.writer.apply(&done, UpdateCause::Executor).await.unwrap();
    let running = StatusUpdate::new("v2", JobStatus::Active).progress(60).at(h.now());
    h.writer.apply(&running, UpdateCause::Executor).await.unwrap();

    // Second session.
    let mut state = ClientState::new(config(), h.clock.clone());
    state.restore(cache.load().await.unwrap());
    assert_eq!(state.len(), 4);
    assert_eq!(state.sweep(), vec!["old".to_string()]);

    let mut snapshots = Vec::new();
    let mut missing = Vec::new();
    for id in state.active_ids() {
        match h.store.find_by_entity_id(&id).await.unwrap() {
            Some(job) => snapshots.push(job),
            None => missing.push(id),
        }
    }
    state.reconcile(&snapshots, &missing);

    assert!(state.get("gone").is_none());
    assert_eq!(state.get("v1").unwrap().status, JobStatus::Completed);
    assert_eq!(state.get("v1").unwrap().progress, 100);
    assert_eq!(state.get("v2").unwrap().progress, 60);
    assert_eq!(state.active_ids(), vec!["v2".to_string()]);

    // The completed job lingers for the grace window only.
    h.advance_secs(5);
    assert_eq!(state.evict_finished(), vec!["v1".to_string()]);
}

/// Jobs with history: one registered after its last store write, one
/// restored from a cache that predates the store row. Both take the
/// store's view on the first resync.
#[tokio::test]
async fn resync_adopts_rows_written_before_registration() {
    let h = Harness::new();
    let dir = tempfile::tempdir().unwrap();
    let cache = ClientCache::new(dir.path().join("observer.json"));

    h.track(NewTrackedJob::new("cached")).await;
    h.track(NewTrackedJob::new("late")).await;

    // "cached" was seen once at 10% before the observer went away.
    h.advance_secs(10);
    let first = StatusUpdate::new("cached", JobStatus::Active).progress(10).at(h.now());
    h.writer.apply(&first, UpdateCause::Executor).await.unwrap();
    {
        let mut state = ClientState::new(config(), h.clock.clone());
        state.register("cached", JobStatus::Pending);
        state.reconcile(&[h.job("cached")], &[]);
        assert_eq!(state.get("cached").unwrap().progress, 10);
        cache.save(&state.snapshot(), h.now()).await.unwrap();
    }

    // Both jobs move on while nobody watches.
    h.advance_secs(60);
    let cached = StatusUpdate::new("cached", JobStatus::Active).progress(70).at(h.now());
    h.writer.apply(&cached, UpdateCause::Executor).await.unwrap();
    let late = StatusUpdate::new("late", JobStatus::Active).progress(40).at(h.now());
    h.writer.apply(&late, UpdateCause::Executor).await.unwrap();

    // The observer comes back a minute later and asks for "late" too.
    h.advance_secs(60);
    let mut state = ClientState::new(config(), h.clock.clone());
    state.restore(cache.load().await.unwrap());
    assert!(state.register("late", JobStatus::Pending));
    assert!(state.sweep().is_empty());

    let snapshots = vec![h.job("cached"), h.job("late")];
    state.reconcile(&snapshots, &[]);

    let cached = state.get("cached").unwrap();
    assert_eq!((cached.status, cached.progress), (JobStatus::Active, 70));
    let late = state.get("late").unwrap();
    assert_eq!((late.status, late.progress), (JobStatus::Active, 40));

    // A completion stamped by the executor before the observer registered
    // but after the store row still lands.
    let completed_at = h.now() - chrono::Duration::seconds(1);
    let mut done = h.job("late");
    done.status = JobStatus::Completed;
    done.progress = 100;
    done.last_updated = completed_at;
    let msg = BroadcastMessage {
        job: done,
        server_timestamp: h.now(),
    };
    assert_eq!(state.apply_update(&ClientUpdate::from(&msg)), ClientApply::Merged);
    assert_eq!(state.get("late").unwrap().status, JobStatus::Completed);

    // Anything older than what the store already said is still rejected.
    let mut stale = h.job("cached");
    stale.progress = 20;
    stale.last_updated = h.now() - chrono::Duration::seconds(90);
    let msg = BroadcastMessage {
        job: stale,
        server_timestamp: h.now(),
    };
    assert_eq!(state.apply_update(&ClientUpdate::from(&msg)), ClientApply::OutOfOrder);
    assert_eq!(state.get("cached").unwrap().progress, 70);
}
