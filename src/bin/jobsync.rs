//! jobsync CLI: run the pipeline daemon, inspect and reset tracked jobs,
//! publish test messages, watch jobs as an observer.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use jobsync::api::{self, AppState};
use jobsync::broker::pgmq::PgmqBroker;
use jobsync::client::ClientCache;
use jobsync::client::watch::{WatchOptions, watch};
use jobsync::clock::{Clock, SystemClock};
use jobsync::config::Config;
use jobsync::config::secrets::{ExposeSecret, redact_url};
use jobsync::config::tuning::Tuning;
use jobsync::db::Db;
use jobsync::engine::{ResetKind, RetryController, StaleLoop, StatusWriter, TokioScheduler};
use jobsync::event::{self, DEFAULT_EVENT_CAPACITY};
use jobsync::gateway::{Gateway, start_heartbeat};
use jobsync::ingest::Subscriber;
use jobsync::model::{JobStatus, NewTrackedJob, TrackedJob};
use jobsync::remote::{HttpAuthority, RemoteAuthority, Unconfigured};
use jobsync::store::JobStore;
use jobsync::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "jobsync", about = "Job-status reconciliation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the subscriber, gateway, stale loop and HTTP server
    Serve {
        /// TOML file with tuning overrides
        #[arg(long)]
        tuning: Option<PathBuf>,
    },
    /// Tracked job operations
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
    /// Enqueue a raw executor status message (JSON)
    Publish {
        payload: String,
    },
    /// Follow jobs as an observer
    Watch {
        /// Server base URL
        #[arg(long, default_value = "http://localhost:8080")]
        server: String,
        /// Observer scope; one live connection per scope
        #[arg(long)]
        observer: String,
        /// Persist observer state here across restarts
        #[arg(long)]
        cache: Option<PathBuf>,
        /// TOML file with tuning overrides (the [client] section applies)
        #[arg(long)]
        tuning: Option<PathBuf>,
        /// Jobs to track
        ids: Vec<String>,
    },
}

#[derive(Subcommand)]
enum JobAction {
    /// Start tracking a job as pending
    Track {
        entity_id: String,
        /// Identifier the executor uses for this job
        #[arg(long)]
        alternate_id: Option<String>,
        #[arg(long, default_value = "generic")]
        kind: String,
    },
    /// Show a job by entity or alternate id
    Show { id: String },
    /// List jobs
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Move a completed or failed job back to pending
    Reset {
        id: String,
        /// Go through a running server so observers see the change
        #[arg(long)]
        server: Option<String>,
    },
    /// Reset and ask the executor to run the job again now
    Retry {
        id: String,
        /// Go through a running server so observers see the change
        #[arg(long)]
        server: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { tuning } => cmd_serve(load_tuning(tuning)?).await,
        Command::Job { action } => cmd_job(action).await,
        Command::Publish { payload } => cmd_publish(payload).await,
        Command::Watch {
            server,
            observer,
            cache,
            tuning,
            ids,
        } => cmd_watch(server, observer, cache, load_tuning(tuning)?, ids).await,
    }
}

fn load_tuning(path: Option<PathBuf>) -> anyhow::Result<Tuning> {
    Ok(match path {
        Some(path) => Tuning::load(&path)?,
        None => Tuning::default(),
    })
}

fn telemetry(config: Option<&Config>) -> anyhow::Result<TelemetryGuard> {
    let (endpoint, log_level) = match config {
        Some(c) => (c.otel_endpoint.clone(), c.log_level.clone()),
        None => (
            std::env::var("OTEL_ENDPOINT").ok(),
            std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        ),
    };
    Ok(init_telemetry(TelemetryConfig {
        endpoint,
        service_name: "jobsync".to_string(),
        log_level,
    })?)
}

fn remote_authority(config: &Config) -> anyhow::Result<Arc<dyn RemoteAuthority>> {
    Ok(match &config.remote_url {
        Some(url) => Arc::new(HttpAuthority::new(url.clone(), config.remote_token.clone())?),
        None => {
            tracing::warn!("REMOTE_AUTHORITY_URL not set; stale jobs will not be reconciled");
            Arc::new(Unconfigured)
        }
    })
}

async fn connect(config: &Config) -> anyhow::Result<Arc<Db>> {
    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;
    Ok(Arc::new(db))
}

async fn cmd_serve(tuning: Tuning) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let _guard = telemetry(Some(&config))?;
    tracing::info!(
        database = %redact_url(&config.database_url),
        queue = %config.queue,
        bind = %config.bind,
        "starting jobsync"
    );

    let db = connect(&config).await?;
    let broker = Arc::new(PgmqBroker::new(
        Arc::clone(&db),
        config.queue.clone(),
        tuning.subscriber.visibility_timeout_secs,
    ));
    broker.ensure_queues().await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (events_tx, events_rx) = event::channel(DEFAULT_EVENT_CAPACITY);
    let store: Arc<dyn JobStore> = db.clone();
    let writer = Arc::new(StatusWriter::new(store, events_tx, Arc::clone(&clock)));
    let remote = remote_authority(&config)?;

    let retries_cancel = CancellationToken::new();
    let scheduler = Arc::new(TokioScheduler::new(retries_cancel));
    let retry = Arc::new(RetryController::new(
        Arc::clone(&writer),
        Arc::clone(&remote),
        scheduler.clone(),
        tuning.backoff_policy(),
    ));
    let stale = Arc::new(StaleLoop::new(
        Arc::clone(&writer),
        remote,
        Arc::clone(&retry),
        tuning.stale_config(),
    ));
    let gateway = Gateway::new(tuning.gateway_config(), Arc::clone(&clock));
    let subscriber = Subscriber::new(broker, Arc::clone(&writer), tuning.subscriber_config());

    let background = CancellationToken::new();
    let relay = tokio::spawn({
        let gateway = Arc::clone(&gateway);
        let cancel = background.clone();
        async move { gateway.relay(events_rx, cancel).await }
    });
    let heartbeat = start_heartbeat(Arc::clone(&gateway), background.clone());
    let stale_task = tokio::spawn({
        let stale = Arc::clone(&stale);
        let cancel = background.clone();
        async move { stale.run(cancel).await }
    });
    let subscriber_task = tokio::spawn({
        let subscriber = subscriber.clone();
        async move { subscriber.run().await }
    });

    let app = api::router(AppState {
        gateway: Arc::clone(&gateway),
        writer,
        retry,
    });
    let listener = tokio::net::TcpListener::bind(&config.bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "http server listening");
    let server_stop = CancellationToken::new();
    let server = tokio::spawn({
        let stop = server_stop.clone();
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
        }
    });

    shutdown_signal().await;
    tracing::info!("shutdown requested");

    // Stop intake first and let in-flight handlers finish their writes.
    subscriber.shutdown();
    match subscriber_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "subscriber exited with error"),
        Err(e) => tracing::error!(error = %e, "subscriber task failed"),
    }

    background.cancel();
    scheduler.shutdown().await;
    let _ = tokio::time::timeout(Duration::from_secs(5), stale_task).await;
    let _ = tokio::time::timeout(Duration::from_secs(5), relay).await;
    let _ = heartbeat.await;

    gateway.shutdown_all();
    server_stop.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "http server error"),
        Err(e) => tracing::error!(error = %e, "http server task failed"),
    }

    tracing::info!("jobsync stopped");
    Ok(())
}

/// Wait for Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

async fn cmd_job(action: JobAction) -> anyhow::Result<()> {
    // Server-side operations don't need the database locally.
    let action = match action {
        JobAction::Reset {
            id,
            server: Some(server),
        } => return post_job_action(&server, &id, "reset").await,
        JobAction::Retry {
            id,
            server: Some(server),
        } => return post_job_action(&server, &id, "retry").await,
        local => local,
    };

    let config = Config::from_env()?;
    let db = connect(&config).await?;

    match action {
        JobAction::Track {
            entity_id,
            alternate_id,
            kind,
        } => {
            let mut new = NewTrackedJob::new(entity_id).kind(kind);
            if let Some(alt) = alternate_id {
                new = new.alternate_id(alt);
            }
            let job = db.insert(new, Utc::now()).await?;
            println!("Tracking: {} (status: {})", job.entity_id, job.status);
        }
        JobAction::Show { id } => {
            let job = resolve(db.as_ref(), &id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        JobAction::List { status, limit } => {
            let status: Option<JobStatus> = match status {
                Some(s) => Some(
                    s.parse()
                        .map_err(|_| anyhow::anyhow!("invalid status: {s}"))?,
                ),
                None => None,
            };
            print_jobs(&db.list(status, limit).await?);
        }
        JobAction::Reset { id, .. } => {
            let (writer, _events) = local_writer(Arc::clone(&db));
            let job = resolve(db.as_ref(), &id).await?;
            let job = writer.reset(&job.entity_id, ResetKind::Reset).await?;
            println!("Reset: {} (status: {})", job.entity_id, job.status);
        }
        JobAction::Retry { id, .. } => {
            let (writer, _events) = local_writer(Arc::clone(&db));
            let writer = Arc::new(writer);
            let remote = remote_authority(&config)?;
            // Manual retries run immediately; nothing is ever scheduled here.
            let scheduler = Arc::new(TokioScheduler::new(CancellationToken::new()));
            let retry = RetryController::new(
                Arc::clone(&writer),
                remote,
                scheduler,
                Tuning::default().backoff_policy(),
            );
            let job = resolve(db.as_ref(), &id).await?;
            let job = retry.retry_now(&job.entity_id).await?;
            println!(
                "Retried: {} (status: {}, retries: {})",
                job.entity_id, job.status, job.retry_count
            );
        }
    }
    Ok(())
}

/// A writer whose events go nowhere; no observers are attached to a CLI run.
fn local_writer(db: Arc<Db>) -> (StatusWriter, event::EventReceiver) {
    let (tx, rx) = event::channel(DEFAULT_EVENT_CAPACITY);
    (StatusWriter::new(db, tx, Arc::new(SystemClock)), rx)
}

async fn resolve(store: &dyn JobStore, id: &str) -> anyhow::Result<TrackedJob> {
    if let Some(job) = store.find_by_entity_id(id).await? {
        return Ok(job);
    }
    store
        .find_by_alternate_id(id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("no tracked job with id '{id}'"))
}

async fn post_job_action(server: &str, id: &str, action: &str) -> anyhow::Result<()> {
    let url = format!("{}/jobs/{id}/{action}", server.trim_end_matches('/'));
    let response = reqwest::Client::new().post(&url).send().await?;
    let status = response.status();
    let body: serde_json::Value = response.json().await?;
    if !status.is_success() {
        anyhow::bail!("{action} failed ({status}): {body}");
    }
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn print_jobs(jobs: &[TrackedJob]) {
    if jobs.is_empty() {
        println!("No tracked jobs found.");
        return;
    }

    println!(
        "{:<24}  {:<10}  {:<10}  {:>4}  {:>5}  {:<20}  UPDATED",
        "ENTITY", "KIND", "STATUS", "PCT", "RETRY", "STAGE"
    );
    println!("{}", "-".repeat(100));
    for job in jobs {
        let stage = job.stage.as_deref().unwrap_or("-");
        let stage: String = stage.chars().take(20).collect();
        println!(
            "{:<24}  {:<10}  {:<10}  {:>4}  {:>5}  {:<20}  {}",
            job.entity_id,
            job.kind,
            job.status,
            job.progress,
            job.retry_count,
            stage,
            job.last_updated.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("\n{} job(s)", jobs.len());
}

async fn cmd_publish(payload: String) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let payload: serde_json::Value = serde_json::from_str(&payload)?;
    let db = connect(&config).await?;
    db.create_queue(&config.queue).await?;
    let msg_id = db.send_to_queue(&config.queue, &payload, 0).await?;
    println!("Published: message {msg_id} on {}", config.queue);
    Ok(())
}

async fn cmd_watch(
    server: String,
    observer: String,
    cache: Option<PathBuf>,
    tuning: Tuning,
    ids: Vec<String>,
) -> anyhow::Result<()> {
    let _guard = telemetry(None)?;

    let mut opts = WatchOptions::new(server, observer);
    opts.cache = cache.map(ClientCache::new);
    opts.ids = ids;
    opts.config = tuning.client_config();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            cancel.cancel();
        }
    });

    watch(opts, cancel, |entry| match serde_json::to_string(entry) {
        Ok(line) => println!("{line}"),
        Err(e) => tracing::warn!(error = %e, "cannot render entry"),
    })
    .await?;
    Ok(())
}
