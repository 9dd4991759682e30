//! Error types for jobsync.

use thiserror::Error;

use crate::model::JobStatus;

#[derive(Debug, Error)]
pub enum Error {
    #[error("tracked job not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("write contention on {0}: gave up after repeated compare-and-write misses")]
    Conflict(String),

    #[error("malformed status message: {0}")]
    Malformed(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("remote authority error: {0}")]
    Remote(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
