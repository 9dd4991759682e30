//! Canonical status update.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use super::job::JobStatus;

/// A status change for one job, in canonical field names.
///
/// Produced by `ingest::normalize` from executor payloads and built directly
/// by the stale loop and retry controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    /// Identifier candidates, in resolution order. Each is tried against the
    /// entity namespace first, then against the alternate namespace.
    pub identifiers: Vec<String>,
    pub status: JobStatus,
    pub progress: Option<u8>,
    pub stage: Option<String>,
    pub error: Option<String>,
    /// Producer timestamp. `None` means "use the receive time".
    pub timestamp: Option<DateTime<Utc>>,
}

impl StatusUpdate {
    pub fn new(identifier: impl Into<String>, status: JobStatus) -> Self {
        Self {
            identifiers: vec![identifier.into()],
            status,
            progress: None,
            stage: None,
            error: None,
            timestamp: None,
        }
    }

    pub fn progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Stamp the update. Sub-microsecond precision is dropped so the value
    /// survives a round trip through Postgres unchanged.
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp.trunc_subsecs(6));
        self
    }

    /// The identifier used in logs.
    pub fn display_id(&self) -> &str {
        self.identifiers.first().map(String::as_str).unwrap_or("-")
    }
}
