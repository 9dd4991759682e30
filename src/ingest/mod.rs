//! Ingestion subscriber: pulls executor status messages off the broker,
//! normalizes them, and applies them through the shared write path.
//!
//! A message is acknowledged only after the store write and event emission
//! are done, so the path is at-least-once; the ordering and stickiness rules
//! in `TrackedJob::plan_update` make redelivery harmless.

pub mod normalize;

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, warn};

use crate::broker::{Broker, Delivery};
use crate::engine::writer::{ApplyOutcome, StatusWriter};
use crate::error::{Error, Result};
use crate::event::UpdateCause;
use crate::telemetry::job::{record_outcome, start_message_span};
use crate::telemetry::metrics;

/// Configuration for the subscriber.
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    /// Max handlers in flight.
    pub concurrency: usize,
    /// Deliveries of an unparseable message before it is dead-lettered.
    pub max_delivery_attempts: i32,
    /// Sleep between polls when the topic is empty.
    pub poll_interval: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            max_delivery_attempts: 5,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// How a single delivery was settled with the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    /// Positively acknowledged after the update was applied or dropped.
    Acked(ApplyOutcome),
    /// Handed back for redelivery.
    Nacked,
    /// Unparseable after the final attempt; parked on the dead-letter queue.
    DeadLettered,
}

impl Handled {
    fn as_str(&self) -> &'static str {
        match self {
            Handled::Acked(_) => "acked",
            Handled::Nacked => "nacked",
            Handled::DeadLettered => "dead_lettered",
        }
    }
}

/// The consumption loop.
#[derive(Clone)]
pub struct Subscriber {
    broker: Arc<dyn Broker>,
    writer: Arc<StatusWriter>,
    config: SubscriberConfig,
    shutdown: CancellationToken,
}

impl Subscriber {
    pub fn new(broker: Arc<dyn Broker>, writer: Arc<StatusWriter>, config: SubscriberConfig) -> Self {
        Self {
            broker,
            writer,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop pulling new messages. `run` returns once in-flight handlers drain.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Run the subscriber until shutdown.
    pub async fn run(&self) -> Result<()> {
        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut handlers: JoinSet<()> = JoinSet::new();

        info!(concurrency = self.config.concurrency, "subscriber started");

        loop {
            while let Some(done) = handlers.try_join_next() {
                if let Err(e) = done {
                    error!("message handler panicked: {e}");
                }
            }

            let free = permits.available_permits();
            if free == 0 {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    done = handlers.join_next() => {
                        if let Some(Err(e)) = done {
                            error!("message handler panicked: {e}");
                        }
                    }
                }
                continue;
            }

            let batch = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                batch = self.broker.receive(free) => batch,
            };

            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => {
                    error!("broker receive failed: {e}");
                    if self.idle().await {
                        break;
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                if self.idle().await {
                    break;
                }
                continue;
            }

            for delivery in batch {
                let permit = Arc::clone(&permits)
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::Other(format!("handler semaphore closed: {e}")))?;
                let this = self.clone();
                handlers.spawn(async move {
                    let _permit = permit;
                    this.handle(delivery).await;
                });
            }
        }

        info!(in_flight = handlers.len(), "subscriber draining");
        while let Some(done) = handlers.join_next().await {
            if let Err(e) = done {
                error!("message handler panicked: {e}");
            }
        }
        info!("subscriber stopped");
        Ok(())
    }

    /// Receive one batch and settle every message in it.
    pub async fn process_batch(&self) -> Result<Vec<Handled>> {
        let batch = self.broker.receive(self.config.concurrency.max(1)).await?;
        let mut set = JoinSet::new();
        for delivery in batch {
            let this = self.clone();
            set.spawn(async move { this.handle(delivery).await });
        }

        let mut settled = Vec::with_capacity(set.len());
        while let Some(done) = set.join_next().await {
            settled.push(done.map_err(|e| Error::Other(format!("message handler panicked: {e}")))?);
        }
        Ok(settled)
    }

    /// Settle a single delivery.
    pub async fn handle(&self, delivery: Delivery) -> Handled {
        let span = start_message_span(delivery.id, delivery.attempt);
        let handled = self.settle(&delivery).instrument(span.clone()).await;
        record_outcome(&span, handled.as_str());
        metrics::messages().add(1, &[KeyValue::new("outcome", handled.as_str())]);
        handled
    }

    async fn settle(&self, delivery: &Delivery) -> Handled {
        let update = match normalize::normalize(&delivery.payload) {
            Ok(update) => update,
            Err(e) if delivery.attempt >= self.config.max_delivery_attempts => {
                warn!(msg_id = delivery.id, attempt = delivery.attempt, error = %e, "giving up on malformed message");
                if let Err(dl) = self.broker.dead_letter(delivery, &e.to_string()).await {
                    error!(msg_id = delivery.id, "dead-letter failed: {dl}");
                }
                return Handled::DeadLettered;
            }
            Err(e) => {
                warn!(msg_id = delivery.id, attempt = delivery.attempt, error = %e, "malformed message, requesting redelivery");
                self.nack(delivery).await;
                return Handled::Nacked;
            }
        };

        tracing::Span::current().record("job.entity_id", update.display_id());

        match self.writer.apply(&update, UpdateCause::Executor).await {
            Ok(outcome) => {
                if let Err(e) = self.broker.ack(delivery).await {
                    // Redelivery is harmless; the write is idempotent.
                    warn!(msg_id = delivery.id, "ack failed: {e}");
                }
                Handled::Acked(outcome)
            }
            Err(e) => {
                error!(msg_id = delivery.id, error = %e, "status write failed, requesting redelivery");
                self.nack(delivery).await;
                Handled::Nacked
            }
        }
    }

    async fn nack(&self, delivery: &Delivery) {
        if let Err(e) = self.broker.nack(delivery).await {
            warn!(msg_id = delivery.id, "nack failed, message returns after its visibility timeout: {e}");
        }
    }

    /// Sleep for the poll interval. Returns `true` if shutdown arrived first.
    async fn idle(&self) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => true,
            _ = tokio::time::sleep(self.config.poll_interval) => false,
        }
    }
}
