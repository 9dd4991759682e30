//! Observer runtime: keeps a [`ClientState`] in sync with a running server.
//!
//! Restores the cache, registers the requested jobs, then loops: connect to
//! the gateway, re-read the authoritative rows over HTTP, apply broadcasts
//! until the socket drops, back off, reconnect.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::StatusCode;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ClientApply, ClientCache, ClientConfig, ClientEntry, ClientState, ClientUpdate};
use crate::clock::{Clock, SystemClock};
use crate::engine::BackoffPolicy;
use crate::error::{Error, Result};
use crate::event::BroadcastMessage;
use crate::model::{JobStatus, TrackedJob};

pub struct WatchOptions {
    /// Server base URL, e.g. `http://localhost:8080`.
    pub server: String,
    pub observer: String,
    pub cache: Option<ClientCache>,
    /// Jobs to start tracking, on top of whatever the cache held.
    pub ids: Vec<String>,
    pub config: ClientConfig,
    /// Delay curve between reconnect attempts. The budget is ignored.
    pub reconnect: BackoffPolicy,
}

impl WatchOptions {
    pub fn new(server: impl Into<String>, observer: impl Into<String>) -> Self {
        Self {
            server: server.into().trim_end_matches('/').to_string(),
            observer: observer.into(),
            cache: None,
            ids: Vec::new(),
            config: ClientConfig::default(),
            reconnect: BackoffPolicy {
                initial: Duration::from_millis(500),
                max: Duration::from_secs(30),
                max_retries: u32::MAX,
            },
        }
    }
}

/// Turn the server base URL into the gateway socket URL for `observer`.
pub fn ws_url(server: &str, observer: &str) -> Result<String> {
    let mut url = reqwest::Url::parse(server)
        .map_err(|e| Error::Config(format!("bad server url {server:?}: {e}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(Error::Config(format!("unsupported server scheme {other:?}"))),
    };
    url.set_scheme(scheme)
        .map_err(|()| Error::Config(format!("cannot use {scheme} for {server:?}")))?;
    url.set_path("/ws");
    url.query_pairs_mut().clear().append_pair("observer", observer);
    Ok(url.to_string())
}

/// Run until `cancel` fires. `on_change` sees every entry that changed.
pub async fn watch<F>(opts: WatchOptions, cancel: CancellationToken, mut on_change: F) -> Result<()>
where
    F: FnMut(&ClientEntry),
{
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut state = ClientState::new(opts.config.clone(), Arc::clone(&clock));

    if let Some(cache) = &opts.cache {
        match cache.load().await {
            Ok(entries) => state.restore(entries),
            Err(e) => warn!(path = %cache.path().display(), error = %e, "ignoring unreadable observer cache"),
        }
    }
    for id in &opts.ids {
        state.register(id.clone(), JobStatus::Pending);
    }
    let removed = state.sweep();
    if !removed.is_empty() {
        info!(count = removed.len(), "discarded stale cached entries");
    }

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let url = ws_url(&opts.server, &opts.observer)?;

    let mut sweep = tokio::time::interval(opts.config.sweep_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut failures: u32 = 0;
    while !cancel.is_cancelled() {
        match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((mut socket, _)) => {
                info!(url = %url, tracked = state.len(), "connected to gateway");
                failures = 0;
                // Connected first, so nothing broadcast during the resync is missed.
                resync(&http, &opts.server, &mut state, &mut on_change).await;
                persist(opts.cache.as_ref(), &state, clock.now()).await;

                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            let _ = socket.close(None).await;
                            break;
                        }
                        _ = sweep.tick() => {
                            let removed = state.sweep();
                            if !removed.is_empty() {
                                debug!(?removed, "observer entries evicted");
                            }
                            persist(opts.cache.as_ref(), &state, clock.now()).await;
                        }
                        frame = socket.next() => match frame {
                            Some(Ok(WsMessage::Text(text))) => apply_frame(&mut state, &text, &mut on_change),
                            Some(Ok(WsMessage::Close(_))) | None => {
                                info!("gateway closed the connection");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(error = %e, "gateway connection lost");
                                break;
                            }
                        },
                    }
                }
            }
            Err(e) => warn!(url = %url, error = %e, "gateway connect failed"),
        }

        if cancel.is_cancelled() {
            break;
        }
        let delay = opts.reconnect.delay_for(failures);
        failures = failures.saturating_add(1);
        debug!(delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    persist(opts.cache.as_ref(), &state, clock.now()).await;
    Ok(())
}

fn apply_frame<F>(state: &mut ClientState, text: &str, on_change: &mut F)
where
    F: FnMut(&ClientEntry),
{
    let msg: BroadcastMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(error = %e, "unreadable broadcast");
            return;
        }
    };
    let update = ClientUpdate::from(&msg);
    match state.apply_update(&update) {
        ClientApply::Merged => {
            if let Some(entry) = state.lookup(&update.entity_id, update.alternate_id.as_deref()) {
                on_change(entry);
            }
        }
        other => debug!(entity_id = %update.entity_id, outcome = ?other, "broadcast not applied"),
    }
}

async fn resync<F>(http: &reqwest::Client, server: &str, state: &mut ClientState, on_change: &mut F)
where
    F: FnMut(&ClientEntry),
{
    let mut snapshots = Vec::new();
    let mut missing = Vec::new();
    for id in state.active_ids() {
        match fetch_job(http, server, &id).await {
            Ok(Some(job)) => snapshots.push(job),
            Ok(None) => missing.push(id),
            // Keep the local view; the next resync tries again.
            Err(e) => warn!(entity_id = %id, error = %e, "resync fetch failed"),
        }
    }
    state.reconcile(&snapshots, &missing);
    for job in &snapshots {
        if let Some(entry) = state.lookup(&job.entity_id, job.alternate_id.as_deref()) {
            on_change(entry);
        }
    }
    info!(
        refreshed = snapshots.len(),
        dropped = missing.len(),
        "resynchronized with the store"
    );
}

async fn fetch_job(http: &reqwest::Client, server: &str, id: &str) -> Result<Option<TrackedJob>> {
    let response = http.get(format!("{server}/jobs/{id}")).send().await?;
    if response.status() == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    let response = response.error_for_status()?;
    Ok(Some(response.json().await?))
}

async fn persist(cache: Option<&ClientCache>, state: &ClientState, now: chrono::DateTime<chrono::Utc>) {
    if let Some(cache) = cache {
        if let Err(e) = cache.save(&state.snapshot(), now).await {
            warn!(path = %cache.path().display(), error = %e, "failed to persist observer cache");
        }
    }
}
