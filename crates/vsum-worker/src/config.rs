//! Worker configuration.

use std::net::SocketAddr;
use std::time::Duration;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Concurrent upload loops
    pub upload_concurrency: usize,
    /// Concurrent summarize loops
    pub summarize_concurrency: usize,
    /// Per-job deadline; the handler is dropped when it elapses
    pub job_timeout: Duration,
    /// Extra lease time on top of `job_timeout`
    pub lease_grace: Duration,
    /// Sleep between polls of an empty queue
    pub poll_interval: Duration,
    /// Random extra sleep, up to this much, to spread pollers out
    pub poll_jitter: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Bucket holding uploaded media
    pub bucket: String,
    pub allowed_mime_types: Vec<String>,
    /// Summarizer calls per minute across all summarize loops
    pub summarizer_rate_per_minute: u32,
    /// Prometheus exporter listen address
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            upload_concurrency: 4,
            summarize_concurrency: 2,
            job_timeout: Duration::from_secs(40 * 60), // transcription alone may take 30 minutes
            lease_grace: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            poll_jitter: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(30),
            bucket: "videos".to_string(),
            allowed_mime_types: vec!["video/mp4".to_string()],
            summarizer_rate_per_minute: 30,
            metrics_addr: None,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            upload_concurrency: env_parse("WORKER_UPLOAD_CONCURRENCY")
                .unwrap_or(defaults.upload_concurrency),
            summarize_concurrency: env_parse("WORKER_SUMMARIZE_CONCURRENCY")
                .unwrap_or(defaults.summarize_concurrency),
            job_timeout: env_parse("WORKER_JOB_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.job_timeout),
            lease_grace: env_parse("WORKER_LEASE_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lease_grace),
            poll_interval: env_parse("WORKER_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            poll_jitter: env_parse("WORKER_POLL_JITTER_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_jitter),
            shutdown_timeout: env_parse("WORKER_SHUTDOWN_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
            bucket: std::env::var("S3_BUCKET").unwrap_or(defaults.bucket),
            allowed_mime_types: std::env::var("UPLOAD_ALLOWED_MIME_TYPES")
                .ok()
                .map(|s| parse_list(&s))
                .filter(|list| !list.is_empty())
                .unwrap_or(defaults.allowed_mime_types),
            summarizer_rate_per_minute: env_parse("SUMMARIZER_RATE_PER_MINUTE")
                .unwrap_or(defaults.summarizer_rate_per_minute),
            metrics_addr: env_parse("WORKER_METRICS_ADDR"),
        }
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}
