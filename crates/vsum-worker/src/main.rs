//! Upload and summarize worker binary.

use std::sync::Arc;

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vsum_db::PgVideoRepository;
use vsum_ml_client::{GeminiClient, Summarizer, WhisperClient};
use vsum_notify::{NotificationConfig, RedisNotificationLog, RedisPushPublisher};
use vsum_queue::{JobQueue, QueueConfig, RedisJobStore};
use vsum_storage::{ObjectStore, S3ObjectStore};
use vsum_worker::{Pipeline, Services, WorkerConfig};

fn init_tracing() -> anyhow::Result<()> {
    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env()
        .add_directive("vsum=info".parse()?)
        .add_directive("sqlx=warn".parse()?);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true).with_target(true))
            .with(env_filter)
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Required for the HTTPS clients
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    dotenvy::dotenv().ok();
    init_tracing()?;

    info!("Starting vsum-worker");
    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to start metrics exporter")?;
        info!(%addr, "Serving Prometheus metrics");
    }

    let queue_config = QueueConfig::from_env();
    let job_store = RedisJobStore::new(&queue_config.redis_url, queue_config.key_prefix.clone())?
        .with_retention(queue_config.retention);
    job_store.ping().await.context("job queue unreachable")?;
    let queue = JobQueue::new(Arc::new(job_store), queue_config);

    let store = S3ObjectStore::from_env()?;
    store
        .ensure_bucket(&config.bucket)
        .await
        .with_context(|| format!("bucket {} unavailable", config.bucket))?;

    let videos = PgVideoRepository::from_env()
        .await
        .context("media store unreachable")?;

    let transcriber = WhisperClient::from_env()?;
    let summarizer = GeminiClient::from_env()?;
    match summarizer.health_check().await {
        Ok(()) => info!("Summarizer reachable"),
        Err(e) => warn!(error = %e, "Summarizer health check failed; continuing"),
    }

    let notify_config = NotificationConfig::from_env();
    let notifications = RedisNotificationLog::new(&notify_config)?;
    notifications
        .ping()
        .await
        .context("notification log unreachable")?;
    let push = RedisPushPublisher::new(&notify_config.redis_url, notify_config.key_prefix.clone())?;

    let pipeline = Pipeline::new(
        &config,
        Services {
            queue,
            store: Arc::new(store),
            videos: Arc::new(videos),
            transcriber: Arc::new(transcriber),
            summarizer: Arc::new(summarizer),
            notifications: Arc::new(notifications),
            push: Arc::new(push),
        },
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        shutdown_tx.send(true).ok();
    });

    pipeline.run(shutdown_rx).await;
    info!("Worker shutdown complete");
    Ok(())
}
