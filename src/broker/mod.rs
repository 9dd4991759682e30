//! Message broker seam.
//!
//! The subscriber only needs four things from a broker: pull a batch,
//! acknowledge, ask for redelivery, and dead-letter. [`PgmqBroker`] does
//! that over pgmq; [`memory::MemoryBroker`] does it in-process for tests.

pub mod memory;
pub mod pgmq;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

pub use memory::MemoryBroker;
pub use pgmq::PgmqBroker;

/// One delivery of a message from the status topic.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-assigned message id. Stable across redeliveries.
    pub id: i64,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: i32,
    pub enqueued_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Pull up to `max` messages. Empty when nothing is ready.
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>>;

    /// Positive acknowledgement: the message is done.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Negative acknowledgement: make the message visible again.
    async fn nack(&self, delivery: &Delivery) -> Result<()>;

    /// Park the message on the dead-letter queue and drop it from the topic.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<()>;
}
