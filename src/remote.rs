//! Remote authority: the executor-side source of truth the stale loop
//! consults when a job has gone quiet.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use crate::error::{Error, Result};
use crate::ingest::normalize::parse_status;
use crate::model::{JobStatus, TrackedJob};

/// What the remote authority knows about a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    /// Still queued or running remotely.
    Running { progress: Option<u8> },
    Completed,
    Failed(String),
    /// The remote has no record of the job.
    Unknown,
}

#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    async fn status(&self, job: &TrackedJob) -> Result<RemoteStatus>;

    /// Ask the executor to run the job again.
    async fn request_retry(&self, job: &TrackedJob) -> Result<()>;
}

/// HTTP client for an executor control API.
///
/// `GET {base}/jobs/{id}` and `POST {base}/jobs/{id}/retry`, where `id` is
/// the job's alternate id when it has one.
pub struct HttpAuthority {
    client: reqwest::Client,
    base_url: String,
    token: Option<SecretString>,
}

#[derive(Debug, Deserialize)]
struct RemoteJobBody {
    status: String,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    error: Option<String>,
}

impl HttpAuthority {
    pub fn new(base_url: impl Into<String>, token: Option<SecretString>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token.expose_secret()),
            None => builder,
        }
    }
}

#[async_trait]
impl RemoteAuthority for HttpAuthority {
    async fn status(&self, job: &TrackedJob) -> Result<RemoteStatus> {
        let url = format!("{}/jobs/{}", self.base_url, job.remote_id());
        let response = self.request(self.client.get(&url)).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(RemoteStatus::Unknown);
        }
        if !response.status().is_success() {
            return Err(Error::Remote(format!("GET {url} returned {}", response.status())));
        }

        let body: RemoteJobBody = response.json().await?;
        let status = parse_status(&body.status)
            .ok_or_else(|| Error::Remote(format!("unknown remote status {:?}", body.status)))?;
        Ok(match status {
            JobStatus::Pending | JobStatus::Active => RemoteStatus::Running {
                progress: body.progress.map(|p| p.round().clamp(0.0, 100.0) as u8),
            },
            JobStatus::Completed => RemoteStatus::Completed,
            JobStatus::Failed => RemoteStatus::Failed(
                body.error
                    .unwrap_or_else(|| "failed on remote executor".to_string()),
            ),
        })
    }

    async fn request_retry(&self, job: &TrackedJob) -> Result<()> {
        let url = format!("{}/jobs/{}/retry", self.base_url, job.remote_id());
        let response = self
            .request(self.client.post(&url))
            .json(&json!({
                "entityId": job.entity_id,
                "kind": job.kind,
                "retryCount": job.retry_count,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::Remote(format!("POST {url} returned {}", response.status())));
        }
        Ok(())
    }
}

/// Stand-in when no remote authority is configured. Every call fails, so
/// the stale loop leaves rows untouched and nothing is retried.
pub struct Unconfigured;

#[async_trait]
impl RemoteAuthority for Unconfigured {
    async fn status(&self, _job: &TrackedJob) -> Result<RemoteStatus> {
        Err(Error::Remote("no remote authority configured".to_string()))
    }

    async fn request_retry(&self, _job: &TrackedJob) -> Result<()> {
        Err(Error::Remote("no remote authority configured".to_string()))
    }
}
