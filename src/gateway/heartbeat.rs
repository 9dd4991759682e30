use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::Gateway;

/// Spawn a background task that pings every observer connection on the
/// configured heartbeat interval, until `cancel` fires.
pub fn start_heartbeat(
    gateway: Arc<Gateway>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(gateway.config().heartbeat);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; nobody needs a ping at startup.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let count = gateway.connection_count();
                    tracing::debug!(count, "observer heartbeat ping");
                    gateway.ping_all();
                }
            }
        }
    })
}
