//! Observer-side reconciliation state.
//!
//! [`ClientState`] tracks only the jobs an observer registered, merges the
//! gateway's broadcasts into them, keeps terminal entries visible for a
//! grace window and sweeps anything that went quiet. It is owned by a
//! single task and takes no locks.

pub mod cache;
pub mod watch;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::Clock;
use crate::event::BroadcastMessage;
use crate::model::{JobStatus, TrackedJob};

pub use cache::ClientCache;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// How long a terminal entry stays visible before eviction.
    pub grace: Duration,
    /// Entries untouched for longer than this are swept, terminal or not.
    pub stale_after: Duration,
    pub sweep_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(5),
            stale_after: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// One locally tracked job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEntry {
    pub entity_id: String,
    #[serde(default)]
    pub alternate_id: Option<String>,
    pub status: JobStatus,
    pub progress: u8,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    /// Timestamp of the newest status merged in. `None` until the first
    /// broadcast or store snapshot arrives.
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    /// Local time of registration or the last merge. Drives the staleness sweep.
    pub touched_at: DateTime<Utc>,
    /// Set when the entry turned terminal; starts the grace window.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ClientEntry {
    fn new(entity_id: String, status: JobStatus, now: DateTime<Utc>) -> Self {
        Self {
            entity_id,
            alternate_id: None,
            status,
            progress: 0,
            stage: None,
            error: None,
            last_updated: None,
            touched_at: now,
            finished_at: status.is_terminal().then_some(now),
        }
    }

    fn overwrite_from(&mut self, job: &TrackedJob, now: DateTime<Utc>) {
        let was_terminal = self.status.is_terminal();
        self.alternate_id = job.alternate_id.clone();
        self.status = job.status;
        self.progress = job.progress;
        self.stage = job.stage.clone();
        self.error = job.error.clone();
        self.last_updated = Some(job.last_updated);
        self.touched_at = now;
        self.finished_at = match (was_terminal, job.status.is_terminal()) {
            (_, false) => None,
            (false, true) => Some(now),
            (true, true) => self.finished_at.or(Some(now)),
        };
    }
}

/// A partial status for one job, as seen by an observer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientUpdate {
    pub entity_id: String,
    pub alternate_id: Option<String>,
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub stage: Option<String>,
    pub error: Option<String>,
    /// Receive time is used when absent.
    pub timestamp: Option<DateTime<Utc>>,
}

impl From<&BroadcastMessage> for ClientUpdate {
    fn from(msg: &BroadcastMessage) -> Self {
        let job = &msg.job;
        Self {
            entity_id: job.entity_id.clone(),
            alternate_id: job.alternate_id.clone(),
            status: Some(job.status),
            progress: Some(job.progress),
            stage: job.stage.clone(),
            error: job.error.clone(),
            timestamp: Some(job.last_updated),
        }
    }
}

/// What `apply_update` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientApply {
    Merged,
    /// Nobody registered this job here.
    Unregistered,
    /// Older than what we already have.
    OutOfOrder,
    /// Entry is terminal and the update was not a reset.
    Sticky,
}

pub struct ClientState {
    config: ClientConfig,
    clock: Arc<dyn Clock>,
    entries: HashMap<String, ClientEntry>,
}

impl ClientState {
    pub fn new(config: ClientConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            entries: HashMap::new(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Start tracking a job. Returns `false` (and changes nothing) if it is
    /// already tracked.
    pub fn register(&mut self, entity_id: impl Into<String>, initial: JobStatus) -> bool {
        let entity_id = entity_id.into();
        if self.entries.contains_key(&entity_id) {
            return false;
        }
        let entry = ClientEntry::new(entity_id.clone(), initial, self.clock.now());
        self.entries.insert(entity_id, entry);
        true
    }

    /// Merge an update into a registered entry. Updates for jobs nobody
    /// registered are dropped.
    pub fn apply_update(&mut self, update: &ClientUpdate) -> ClientApply {
        let now = self.clock.now();
        let Some(key) = self.key_for(update) else {
            debug!(entity_id = %update.entity_id, "update for unregistered job ignored");
            return ClientApply::Unregistered;
        };
        let Some(entry) = self.entries.get_mut(&key) else {
            return ClientApply::Unregistered;
        };

        let ts = update.timestamp.unwrap_or(now);
        if entry.last_updated.is_some_and(|prev| ts < prev) {
            return ClientApply::OutOfOrder;
        }
        if entry.status.is_terminal() && update.status != Some(JobStatus::Pending) {
            return ClientApply::Sticky;
        }

        if let Some(status) = update.status {
            if status.is_terminal() && !entry.status.is_terminal() {
                entry.finished_at = Some(now);
            } else if !status.is_terminal() {
                entry.finished_at = None;
            }
            if status == JobStatus::Pending && entry.status.is_terminal() {
                // Reset: start from a clean slate.
                entry.progress = 0;
                entry.stage = None;
                entry.error = None;
            }
            entry.status = status;
        }
        if let Some(progress) = update.progress {
            entry.progress = progress.min(100);
        }
        if update.stage.is_some() {
            entry.stage = update.stage.clone();
        }
        if entry.status != JobStatus::Failed {
            entry.error = None;
        } else if update.error.is_some() {
            entry.error = update.error.clone();
        }
        if update.alternate_id.is_some() {
            entry.alternate_id = update.alternate_id.clone();
        }
        entry.last_updated = Some(ts);
        entry.touched_at = now;
        ClientApply::Merged
    }

    fn key_for(&self, update: &ClientUpdate) -> Option<String> {
        self.find_key(&update.entity_id, update.alternate_id.as_deref())
    }

    /// Entries may be registered under either identifier.
    fn find_key(&self, entity_id: &str, alternate_id: Option<&str>) -> Option<String> {
        std::iter::once(entity_id)
            .chain(alternate_id)
            .find(|id| self.entries.contains_key(*id))
            .map(str::to_string)
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|(_, e)| e.alternate_id.as_deref() == Some(entity_id))
                    .map(|(key, _)| key.clone())
            })
    }

    /// Remove terminal entries whose grace window has passed.
    pub fn evict_finished(&mut self) -> Vec<String> {
        let now = self.clock.now();
        let grace = to_chrono(self.config.grace);
        self.remove_where(|e| e.finished_at.is_some_and(|at| now - at >= grace))
    }

    /// Remove every entry not touched locally within `threshold`, whatever
    /// its status.
    pub fn sweep_stale(&mut self, threshold: Duration) -> Vec<String> {
        let Some(cutoff) = self.clock.now().checked_sub_signed(to_chrono(threshold)) else {
            return Vec::new();
        };
        self.remove_where(|e| e.touched_at < cutoff)
    }

    /// Eviction plus staleness sweep with the configured threshold.
    pub fn sweep(&mut self) -> Vec<String> {
        let mut removed = self.evict_finished();
        removed.extend(self.sweep_stale(self.config.stale_after));
        removed
    }

    fn remove_where(&mut self, pred: impl Fn(&ClientEntry) -> bool) -> Vec<String> {
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| pred(e))
            .map(|(key, _)| key.clone())
            .collect();
        for id in &doomed {
            self.entries.remove(id);
        }
        doomed
    }

    /// Re-synchronize with authoritative rows. Entries the store no longer
    /// knows are dropped. The store wins unless a newer status was already
    /// merged; an entry that never saw a status takes the snapshot as is.
    pub fn reconcile(&mut self, snapshots: &[TrackedJob], missing: &[String]) {
        let now = self.clock.now();
        for job in snapshots {
            let Some(key) = self.find_key(&job.entity_id, job.alternate_id.as_deref()) else {
                continue;
            };
            if let Some(entry) = self.entries.get_mut(&key) {
                if entry.last_updated.is_none_or(|prev| job.last_updated >= prev) {
                    entry.overwrite_from(job, now);
                }
            }
        }
        for id in missing {
            if self.entries.remove(id).is_some() {
                debug!(entity_id = %id, "job unknown to the store, dropped");
            }
        }
    }

    /// Ids of entries that are not terminal.
    pub fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.status.is_terminal())
            .map(|(key, _)| key.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn get(&self, entity_id: &str) -> Option<&ClientEntry> {
        self.entries.get(entity_id)
    }

    /// Find an entry by either of a job's identifiers.
    pub fn lookup(&self, entity_id: &str, alternate_id: Option<&str>) -> Option<&ClientEntry> {
        self.find_key(entity_id, alternate_id)
            .and_then(|key| self.entries.get(&key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries, ordered by id, for persistence or display.
    pub fn snapshot(&self) -> Vec<ClientEntry> {
        let mut entries: Vec<ClientEntry> = self.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        entries
    }

    /// Replace the current entries with persisted ones.
    pub fn restore(&mut self, entries: Vec<ClientEntry>) {
        self.entries = entries
            .into_iter()
            .map(|e| (e.entity_id.clone(), e))
            .collect();
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
