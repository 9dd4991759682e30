//! Operational tuning loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file at all) yields
//! a working configuration:
//!
//! ```toml
//! [subscriber]
//! concurrency = 16
//!
//! [retry]
//! max_retries = 5
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::client::ClientConfig;
use crate::engine::{BackoffPolicy, StaleConfig};
use crate::error::{Error, Result};
use crate::gateway::GatewayConfig;
use crate::ingest::SubscriberConfig;

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Tuning {
    pub subscriber: SubscriberTuning,
    pub stale: StaleTuning,
    pub retry: RetryTuning,
    pub gateway: GatewayTuning,
    pub client: ClientTuning,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SubscriberTuning {
    pub concurrency: usize,
    pub max_delivery_attempts: i32,
    pub visibility_timeout_secs: i32,
    pub poll_interval_ms: u64,
}

impl Default for SubscriberTuning {
    fn default() -> Self {
        Self {
            concurrency: 8,
            max_delivery_attempts: 5,
            visibility_timeout_secs: 30,
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct StaleTuning {
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub batch_limit: i64,
}

impl Default for StaleTuning {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            timeout_secs: 900,
            batch_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RetryTuning {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_retries: u32,
}

impl Default for RetryTuning {
    fn default() -> Self {
        Self {
            initial_delay_ms: 5_000,
            max_delay_ms: 300_000,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayTuning {
    /// Outbound buffer per observer connection.
    pub channel_capacity: usize,
    pub heartbeat_secs: u64,
}

impl Default for GatewayTuning {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            heartbeat_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ClientTuning {
    pub grace_ms: u64,
    pub stale_after_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for ClientTuning {
    fn default() -> Self {
        Self {
            grace_ms: 5_000,
            stale_after_secs: 3_600,
            sweep_interval_secs: 30,
        }
    }
}

impl Tuning {
    /// Parse tuning from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let tuning: Tuning =
            toml::from_str(content).map_err(|e| Error::Config(format!("bad tuning config: {e}")))?;
        tuning.validate()?;
        Ok(tuning)
    }

    /// Load tuning from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read tuning file {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    fn validate(&self) -> Result<()> {
        if self.subscriber.concurrency == 0 {
            return Err(Error::Config("subscriber.concurrency must be at least 1".into()));
        }
        if self.subscriber.max_delivery_attempts < 1 {
            return Err(Error::Config(
                "subscriber.max_delivery_attempts must be at least 1".into(),
            ));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(Error::Config(
                "retry.initial_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        if self.gateway.channel_capacity == 0 {
            return Err(Error::Config("gateway.channel_capacity must be at least 1".into()));
        }
        Ok(())
    }

    pub fn subscriber_config(&self) -> SubscriberConfig {
        SubscriberConfig {
            concurrency: self.subscriber.concurrency,
            max_delivery_attempts: self.subscriber.max_delivery_attempts,
            poll_interval: Duration::from_millis(self.subscriber.poll_interval_ms),
        }
    }

    pub fn stale_config(&self) -> StaleConfig {
        StaleConfig {
            interval: Duration::from_secs(self.stale.interval_secs),
            timeout: Duration::from_secs(self.stale.timeout_secs),
            batch_limit: self.stale.batch_limit,
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(self.retry.initial_delay_ms),
            max: Duration::from_millis(self.retry.max_delay_ms),
            max_retries: self.retry.max_retries,
        }
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            channel_capacity: self.gateway.channel_capacity,
            heartbeat: Duration::from_secs(self.gateway.heartbeat_secs),
        }
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            grace: Duration::from_millis(self.client.grace_ms),
            stale_after: Duration::from_secs(self.client.stale_after_secs),
            sweep_interval: Duration::from_secs(self.client.sweep_interval_secs),
        }
    }
}
