//! pgmq-backed broker.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{Broker, Delivery};
use crate::db::Db;
use crate::error::Result;

/// Consumes one pgmq queue; dead letters go to `<queue>_dlq`.
pub struct PgmqBroker {
    db: Arc<Db>,
    queue: String,
    dead_letter_queue: String,
    visibility_timeout: i32,
}

impl PgmqBroker {
    pub fn new(db: Arc<Db>, queue: impl Into<String>, visibility_timeout: i32) -> Self {
        let queue = queue.into();
        Self {
            db,
            dead_letter_queue: format!("{queue}_dlq"),
            queue,
            visibility_timeout,
        }
    }

    /// Create the topic queue and its dead-letter queue (idempotent).
    pub async fn ensure_queues(&self) -> Result<()> {
        self.db.create_queue(&self.queue).await?;
        self.db.create_queue(&self.dead_letter_queue).await
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn dead_letter_queue(&self) -> &str {
        &self.dead_letter_queue
    }
}

#[async_trait]
impl Broker for PgmqBroker {
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>> {
        let qty = i32::try_from(max).unwrap_or(i32::MAX);
        let messages = self
            .db
            .read_batch(&self.queue, self.visibility_timeout, qty)
            .await?;
        Ok(messages
            .into_iter()
            .map(|m| Delivery {
                id: m.msg_id,
                attempt: m.read_ct,
                enqueued_at: m.enqueued_at,
                payload: m.message,
            })
            .collect())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.db.archive_message(&self.queue, delivery.id).await
    }

    async fn nack(&self, delivery: &Delivery) -> Result<()> {
        self.db.set_visibility(&self.queue, delivery.id, 0).await
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<()> {
        let parked = json!({
            "msg_id": delivery.id,
            "attempts": delivery.attempt,
            "enqueued_at": delivery.enqueued_at,
            "reason": reason,
            "payload": delivery.payload,
        });
        self.db
            .send_to_queue(&self.dead_letter_queue, &parked, 0)
            .await?;
        self.db.archive_message(&self.queue, delivery.id).await
    }
}
