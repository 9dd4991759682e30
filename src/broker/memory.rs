//! In-process broker with redelivery semantics close to pgmq.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;

use super::{Broker, Delivery};
use crate::error::Result;

#[derive(Default)]
struct Inner {
    next_id: i64,
    ready: VecDeque<Delivery>,
    in_flight: Vec<Delivery>,
    acked: Vec<i64>,
    nacked: Vec<i64>,
    dead: Vec<(Delivery, String)>,
}

/// A queue held in memory. Nacked messages go to the back of the queue with
/// their attempt counter intact; `receive` bumps it like pgmq's `read_ct`.
#[derive(Default)]
pub struct MemoryBroker {
    inner: Mutex<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a payload. Returns its message id.
    pub fn publish(&self, payload: serde_json::Value) -> i64 {
        let mut inner = self.inner();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.ready.push_back(Delivery {
            id,
            attempt: 0,
            enqueued_at: Utc::now(),
            payload,
        });
        id
    }

    pub fn ready_len(&self) -> usize {
        self.inner().ready.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner().in_flight.len()
    }

    pub fn acked(&self) -> Vec<i64> {
        self.inner().acked.clone()
    }

    pub fn nacked(&self) -> Vec<i64> {
        self.inner().nacked.clone()
    }

    /// Dead-lettered message ids with the recorded reason.
    pub fn dead_lettered(&self) -> Vec<(i64, String)> {
        self.inner()
            .dead
            .iter()
            .map(|(d, reason)| (d.id, reason.clone()))
            .collect()
    }

    fn take_in_flight(inner: &mut Inner, id: i64) -> Option<Delivery> {
        let pos = inner.in_flight.iter().position(|d| d.id == id)?;
        Some(inner.in_flight.swap_remove(pos))
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn receive(&self, max: usize) -> Result<Vec<Delivery>> {
        let mut inner = self.inner();
        let n = max.min(inner.ready.len());
        let batch: Vec<Delivery> = inner
            .ready
            .drain(..n)
            .map(|mut d| {
                d.attempt += 1;
                d
            })
            .collect();
        inner.in_flight.extend(batch.iter().cloned());
        Ok(batch)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut inner = self.inner();
        Self::take_in_flight(&mut inner, delivery.id);
        inner.acked.push(delivery.id);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<()> {
        let mut inner = self.inner();
        if let Some(d) = Self::take_in_flight(&mut inner, delivery.id) {
            inner.ready.push_back(d);
        }
        inner.nacked.push(delivery.id);
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<()> {
        let mut inner = self.inner();
        if let Some(d) = Self::take_in_flight(&mut inner, delivery.id) {
            inner.dead.push((d, reason.to_string()));
        }
        Ok(())
    }
}
