//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! Sensitive values wrapped in secrecy::SecretString to prevent log leaks.
//! Operational knobs live in [`tuning::Tuning`] and come from an optional
//! TOML file instead.

pub mod secrets;
pub mod tuning;

use crate::error::{Error, Result};
use secrecy::SecretString;

pub const DEFAULT_QUEUE: &str = "job_status";
pub const DEFAULT_BIND: &str = "0.0.0.0:8080";

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    /// pgmq queue the executor publishes status messages to.
    pub queue: String,
    /// Listen address for the gateway and HTTP endpoints.
    pub bind: String,
    /// Base URL of the executor control API. Unset means unreachable.
    pub remote_url: Option<String>,
    pub remote_token: Option<SecretString>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: optional_var("OTEL_ENDPOINT"),
            log_level: optional_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            queue: optional_var("JOBSYNC_QUEUE").unwrap_or_else(|| DEFAULT_QUEUE.to_string()),
            bind: optional_var("JOBSYNC_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string()),
            remote_url: optional_var("REMOTE_AUTHORITY_URL"),
            remote_token: optional_var("REMOTE_AUTHORITY_TOKEN").map(SecretString::from),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    optional_var(name)
        .ok_or_else(|| Error::Config(format!("required environment variable {name} is not set")))
}

// Empty counts as unset.
fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
