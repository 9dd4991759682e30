//! Reconciliation engine: the shared write path, stale detection and
//! retry scheduling.

pub mod retry;
pub mod schedule;
pub mod stale;
pub mod writer;

pub use retry::{BackoffPolicy, RetryController};
pub use schedule::{RecordingScheduler, Scheduler, TokioScheduler};
pub use stale::{CycleReport, StaleConfig, StaleLoop};
pub use writer::{ApplyOutcome, ResetKind, StatusWriter};
