use metrics_exporter_prometheus::PrometheusBuilder;
use site_jobs::{
    config::WorkerConfig,
    db::{self, PgJobStore},
    handlers,
    services::queue::JobQueue,
    worker::Worker,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting background job worker");

    // A non-zero exit hands recovery to the process supervisor
    if let Err(e) = run().await {
        tracing::error!(error = %e, "Worker exiting");
        std::process::exit(1);
    }

    tracing::info!("Worker stopped");
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = WorkerConfig::from_env()?;

    // Prometheus exporter (optional)
    if let Some(addr) = &config.metrics_addr {
        let addr: SocketAddr = addr.parse()?;
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        describe_metrics();
        tracing::info!(%addr, "Metrics exporter listening");
    }

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url).await?;

    if config.run_migrations {
        tracing::info!("Running database migrations");
        db::run_migrations(&db_pool).await?;
    }

    let queue = Arc::new(JobQueue::with_retry_policy(
        PgJobStore::new(db_pool),
        config.retry_policy(),
    ));

    // Every type this process claims must have a handler before the loop starts
    let registry = handlers::build_registry(&config, queue.clone());
    let options = config.worker_options();
    registry.ensure_registered(&options.job_types)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Termination signal received, finishing current job");
        let _ = shutdown_tx.send(true);
    });

    tracing::info!(worker_id = %options.worker_id, "Worker ready, starting job processing loop");
    Worker::new(queue, Arc::new(registry), options, shutdown_rx)
        .run()
        .await?;

    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
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

fn describe_metrics() {
    metrics::describe_counter!("jobs_claimed_total", "Jobs claimed by this worker");
    metrics::describe_counter!("jobs_completed_total", "Jobs finalized as completed");
    metrics::describe_counter!("jobs_retried_total", "Failed jobs rescheduled for another attempt");
    metrics::describe_counter!("jobs_failed_total", "Jobs finalized as terminally failed");
    metrics::describe_counter!(
        "jobs_reaped_total",
        "Processing jobs released after their lease expired"
    );
    metrics::describe_counter!(
        "worker_loop_errors_total",
        "Store errors while claiming or finalizing"
    );
    metrics::describe_histogram!(
        "job_duration_seconds",
        "Wall time spent in a job handler"
    );
}
