//! # jobsync
//!
//! Job-status reconciliation pipeline for work running on external
//! executors.
//!
//! Executor notifications arrive on a pgmq queue, are normalized and written
//! to the entity store under ordering and terminal-state rules, then fanned
//! out to live observers over WebSocket. A stale loop re-checks quiet jobs
//! against the remote authority and drives bounded exponential-backoff
//! retries. The observer side keeps its own reconciled, persisted view.

pub mod api;
pub mod broker;
pub mod client;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod gateway;
pub mod ingest;
pub mod model;
pub mod remote;
pub mod store;
pub mod telemetry;
