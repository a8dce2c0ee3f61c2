use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use shotdiff::config::AppConfig;
use shotdiff::db;
use shotdiff::pipeline::Pipeline;
use shotdiff::routes;
use shotdiff::services::queue::TaskQueue;
use shotdiff::services::tracker::CompletionTracker;

/// How often abandoned queue claims and stalled releases are looked for.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting shotdiff capture worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Worker metrics are scraped from their own listener.
    let metrics_addr: SocketAddr = std::env::var("WORKER_METRICS_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:9100".to_string())
        .parse()
        .expect("Invalid WORKER_METRICS_ADDR");
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .expect("Failed to install Prometheus exporter");
    routes::metrics::describe_metrics();

    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url, config.worker_concurrency as u32 + 4)
        .await
        .expect("Failed to connect to database");

    let pipeline = Pipeline::connect(&config, db_pool).expect("Failed to initialize pipeline");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Each claim covers one attempt; anything far past the timeout is abandoned.
    let lease = config.capture_timeout() * (config.max_capture_retries.max(1) + 1);
    let maintenance = tokio::spawn(maintenance_loop(
        pipeline.queue.clone(),
        pipeline.tracker.clone(),
        lease,
        shutdown_rx.clone(),
    ));
    let sweeper = tokio::spawn(pipeline.sweeper.clone().run(shutdown_rx.clone()));
    let dispatcher = tokio::spawn(pipeline.dispatcher.clone().run(shutdown_rx));

    tracing::info!(
        workers = config.worker_concurrency,
        per_host = config.per_host_concurrency,
        "Worker ready"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown requested; finishing in-flight captures");
    let _ = shutdown_tx.send(true);

    for (name, handle) in [("dispatcher", dispatcher), ("sweeper", sweeper), ("maintenance", maintenance)] {
        if let Err(e) = handle.await {
            tracing::error!(task = name, error = %e, "Background task panicked");
        }
    }
    tracing::info!("Worker stopped");
}

/// Requeue abandoned claims, finish releases stuck behind a failed
/// completion, and publish queue depth.
async fn maintenance_loop(
    queue: Arc<dyn TaskQueue>,
    tracker: Arc<CompletionTracker>,
    lease: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match queue.reclaim_stale(lease).await {
                    Ok(0) => {}
                    Ok(moved) => tracing::warn!(moved, "Reclaimed abandoned capture tasks"),
                    Err(e) => tracing::error!(error = %e, "Failed to reclaim stale tasks"),
                }
                match tracker.recover_stalled().await {
                    Ok(0) => {}
                    Ok(recovered) => tracing::warn!(recovered, "Finished stalled releases"),
                    Err(e) => tracing::error!(error = %e, "Failed to list stalled releases"),
                }
                match queue.depth().await {
                    Ok(depth) => metrics::gauge!("capture_queue_depth").set(depth as f64),
                    Err(e) => tracing::warn!(error = %e, "Failed to read queue depth"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
