//! Deferred task scheduling.
//!
//! The retry controller never sleeps itself; it hands a delay and a task to
//! a [`Scheduler`]. Production uses [`TokioScheduler`]; tests use
//! [`RecordingScheduler`] to observe delays and run tasks on demand.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

pub type Task = BoxFuture<'static, ()>;

pub trait Scheduler: Send + Sync {
    /// Run `task` once `delay` has elapsed.
    fn schedule(&self, delay: Duration, task: Task);
}

/// Spawns each task on the tokio runtime behind a sleep.
///
/// Pending tasks are dropped when the scheduler's token is cancelled.
pub struct TokioScheduler {
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl TokioScheduler {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    /// Number of scheduled tasks that have not finished yet.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel everything still waiting and wait for running tasks to end.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Task) {
        let cancel = self.cancel.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(delay_ms = delay.as_millis() as u64, "scheduled task cancelled");
                }
                _ = tokio::time::sleep(delay) => task.await,
            }
        });
    }
}

/// Records every scheduled task instead of running it.
#[derive(Default)]
pub struct RecordingScheduler {
    queued: Mutex<Vec<(Duration, Task)>>,
    history: Mutex<Vec<Duration>>,
}

impl RecordingScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
        m.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every delay ever requested, in order.
    pub fn delays(&self) -> Vec<Duration> {
        Self::lock(&self.history).clone()
    }

    pub fn queued(&self) -> usize {
        Self::lock(&self.queued).len()
    }

    /// Run all queued tasks, in the order they were scheduled, as if their
    /// delays had elapsed. Returns how many ran.
    pub async fn run_due(&self) -> usize {
        let tasks: Vec<(Duration, Task)> = std::mem::take(&mut *Self::lock(&self.queued));
        let n = tasks.len();
        for (_, task) in tasks {
            task.await;
        }
        n
    }
}

impl Scheduler for RecordingScheduler {
    fn schedule(&self, delay: Duration, task: Task) {
        Self::lock(&self.history).push(delay);
        Self::lock(&self.queued).push((delay, task));
    }
}
