//! Broadcast gateway: fans job events out to live observer connections.
//!
//! Connections are keyed by observer scope. An observer owns exactly one
//! live registration; registering again replaces (and closes) the previous
//! one. The [`Registration`] handle removes its own entry when dropped,
//! whatever state the transport was in, so a torn-down socket can never
//! leave a stale target behind.

mod heartbeat;
pub mod socket;

pub use heartbeat::start_heartbeat;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::event::{BroadcastMessage, EventReceiver, JobEvent};
use crate::telemetry::metrics;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Outbound buffer per connection. A full buffer drops messages for
    /// that observer only.
    pub channel_capacity: usize,
    pub heartbeat: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            heartbeat: Duration::from_secs(30),
        }
    }
}

/// A frame queued for one connection. The socket task turns these into
/// transport frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A serialized [`BroadcastMessage`].
    Text(Arc<str>),
    Ping,
    Close,
}

struct Slot {
    conn_id: u64,
    sender: mpsc::Sender<Outbound>,
    connected_at: DateTime<Utc>,
}

/// Result of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub sent: usize,
    /// Buffer full; this message skipped for that observer.
    pub dropped: usize,
    /// Receiver gone; connection removed.
    pub pruned: usize,
}

pub struct Gateway {
    config: GatewayConfig,
    clock: Arc<dyn Clock>,
    next_conn: AtomicU64,
    connections: RwLock<HashMap<String, Slot>>,
}

/// An observer's live registration.
///
/// Owns the outbound receiver. Dropping it unregisters the connection,
/// unless a newer registration for the same observer already replaced it.
pub struct Registration {
    gateway: Arc<Gateway>,
    observer: String,
    conn_id: u64,
    rx: mpsc::Receiver<Outbound>,
}

impl Registration {
    pub fn observer(&self) -> &str {
        &self.observer
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Next frame for this connection. `None` once the gateway has dropped
    /// the sender (replaced, pruned or shut down).
    pub async fn recv(&mut self) -> Option<Outbound> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Outbound> {
        self.rx.try_recv().ok()
    }

    /// Stop accepting frames without giving up the registration. The next
    /// broadcast finds the connection closed and prunes it.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.gateway.remove_if_current(&self.observer, self.conn_id);
    }
}

impl Gateway {
    pub fn new(config: GatewayConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            config,
            clock,
            next_conn: AtomicU64::new(1),
            connections: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Slot>> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Slot>> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection for `observer`, replacing any previous one.
    pub fn register(self: &Arc<Self>, observer: impl Into<String>) -> Registration {
        let observer = observer.into();
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let (sender, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let slot = Slot {
            conn_id,
            sender,
            connected_at: self.clock.now(),
        };

        let replaced = self.write().insert(observer.clone(), slot);
        if let Some(old) = replaced {
            // Best effort; the old socket also ends when its sender drops here.
            let _ = old.sender.try_send(Outbound::Close);
            info!(
                observer = %observer,
                old_conn = old.conn_id,
                new_conn = conn_id,
                "observer re-registered, previous connection replaced"
            );
        } else {
            info!(observer = %observer, conn_id, "observer registered");
        }

        Registration {
            gateway: Arc::clone(self),
            observer,
            conn_id,
            rx,
        }
    }

    /// Explicitly unregister. Equivalent to dropping the handle.
    pub fn unregister(&self, registration: Registration) {
        drop(registration);
    }

    fn remove_if_current(&self, observer: &str, conn_id: u64) {
        let mut conns = self.write();
        if conns.get(observer).is_some_and(|slot| slot.conn_id == conn_id) {
            if let Some(slot) = conns.remove(observer) {
                let lifetime = self.clock.now() - slot.connected_at;
                debug!(
                    observer,
                    conn_id,
                    lifetime_secs = lifetime.num_seconds(),
                    "observer unregistered"
                );
            }
        }
    }

    /// Serialize the event once and queue it on every live connection.
    ///
    /// Never blocks: a full buffer skips that observer, a closed one is
    /// pruned. Neither affects the others.
    pub fn broadcast(&self, event: &JobEvent) -> BroadcastReport {
        let message = BroadcastMessage::relay(event, self.clock.now());
        let text: Arc<str> = match serde_json::to_string(&message) {
            Ok(text) => text.into(),
            Err(e) => {
                error!(entity_id = %event.job.entity_id, error = %e, "failed to serialize broadcast");
                return BroadcastReport::default();
            }
        };

        let mut report = BroadcastReport::default();
        let mut closed = Vec::new();
        {
            let conns = self.read();
            for (observer, slot) in conns.iter() {
                match slot.sender.try_send(Outbound::Text(Arc::clone(&text))) {
                    Ok(()) => report.sent += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!(observer = %observer, entity_id = %event.job.entity_id, "observer buffer full, message dropped");
                        report.dropped += 1;
                    }
                    Err(TrySendError::Closed(_)) => closed.push((observer.clone(), slot.conn_id)),
                }
            }
        }

        for (observer, conn_id) in closed {
            self.remove_if_current(&observer, conn_id);
            report.pruned += 1;
        }

        for (result, n) in [
            ("sent", report.sent),
            ("dropped", report.dropped),
            ("closed", report.pruned),
        ] {
            if n > 0 {
                metrics::broadcasts().add(n as u64, &[KeyValue::new("result", result)]);
            }
        }
        report
    }

    /// Consume the internal event channel until it closes or `cancel` fires.
    /// Events already buffered at cancellation are still delivered.
    pub async fn relay(&self, mut events: EventReceiver, cancel: CancellationToken) {
        info!("gateway relay started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let mut flushed = 0usize;
                    while let Ok(event) = events.try_recv() {
                        self.broadcast(&event);
                        flushed += 1;
                    }
                    debug!(flushed, "relay flushed buffered events");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => {
                        let report = self.broadcast(&event);
                        debug!(
                            entity_id = %event.job.entity_id,
                            status = %event.job.status,
                            cause = ?event.cause,
                            sent = report.sent,
                            "event relayed"
                        );
                    }
                    None => break,
                },
            }
        }
        info!("gateway relay stopped");
    }

    pub fn connection_count(&self) -> usize {
        self.read().len()
    }

    pub fn observers(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn ping_all(&self) {
        for slot in self.read().values() {
            let _ = slot.sender.try_send(Outbound::Ping);
        }
    }

    /// Send a close frame to every connection and forget them all.
    pub fn shutdown_all(&self) {
        let mut conns = self.write();
        let count = conns.len();
        for slot in conns.values() {
            let _ = slot.sender.try_send(Outbound::Close);
        }
        conns.clear();
        info!(count, "closed all observer connections");
    }
}
