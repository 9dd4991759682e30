//! Internal job events and the wire message relayed to observers.
//!
//! Every accepted write produces exactly one [`JobEvent`] on the typed
//! channel between the writers (subscriber, stale loop, retry controller,
//! reset endpoint) and the gateway. The gateway turns each one into a
//! [`BroadcastMessage`] stamped with the relay time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::model::TrackedJob;

/// Sender half of the internal event channel.
pub type EventSender = mpsc::Sender<JobEvent>;
/// Receiver half of the internal event channel.
pub type EventReceiver = mpsc::Receiver<JobEvent>;

/// Default buffer size for the internal event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Create the internal event channel.
pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    mpsc::channel(capacity)
}

/// Which path produced a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateCause {
    /// A status message from the executor.
    Executor,
    /// The stale loop reconciled against the remote authority.
    Reconciled,
    /// An explicit reset.
    Reset,
    /// A retry attempt (automatic or manual).
    Retry,
}

/// A successful write to the entity store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEvent {
    /// The row as written.
    pub job: TrackedJob,
    pub cause: UpdateCause,
}

/// Outbound message: the normalized job fields plus `serverTimestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    #[serde(flatten)]
    pub job: TrackedJob,
    /// When the gateway relayed this message.
    pub server_timestamp: DateTime<Utc>,
}

impl BroadcastMessage {
    pub fn relay(event: &JobEvent, now: DateTime<Utc>) -> Self {
        Self {
            job: event.job.clone(),
            server_timestamp: now,
        }
    }
}
