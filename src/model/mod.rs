//! Core data model.
//!
//! A tracked job is one status record per piece of remote work the owning
//! system cares about. A status update is the canonical, already-normalized
//! form of whatever an executor pushed at us.

pub mod job;
pub mod update;

pub use job::{Decision, JobStatus, NewTrackedJob, SkipReason, TrackedJob};
pub use update::StatusUpdate;
