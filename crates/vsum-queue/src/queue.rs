//! Typed queue facade over a [`JobStore`].

use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use vsum_models::{JobId, Stage};

use crate::error::QueueResult;
use crate::job::{QueueJob, SummarizeJobPayload, UploadJobPayload};
use crate::memory::MemoryJobStore;
use crate::policy::{BackoffPolicy, EnqueueOptions, FailOutcome, FailureKind};
use crate::redis_store::RedisJobStore;
use crate::store::{JobRecord, JobStore, Lease, QueueStats, Retention};

/// Attempt limit and backoff for one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageOptions {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl StageOptions {
    /// Upload stage: five immediate attempts.
    pub fn upload_default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffPolicy::Immediate,
        }
    }

    /// Summarize stage: three attempts with exponential backoff.
    pub fn summarize_default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::exponential(Duration::from_secs(3), Duration::from_secs(300)),
        }
    }

    fn enqueue_options(&self) -> EnqueueOptions {
        EnqueueOptions::new(self.max_attempts, self.backoff)
    }

    /// Read `{prefix}_MAX_ATTEMPTS`, `{prefix}_BACKOFF_BASE_MS` and
    /// `{prefix}_BACKOFF_MAX_MS`, falling back to `default`.
    fn from_env(prefix: &str, default: Self) -> Self {
        let (default_base, default_max) = default.backoff.as_millis_pair();
        let max_attempts = env_parse(&format!("{prefix}_MAX_ATTEMPTS")).unwrap_or(default.max_attempts);
        let base_ms = env_parse(&format!("{prefix}_BACKOFF_BASE_MS")).unwrap_or(default_base);
        let max_ms = env_parse(&format!("{prefix}_BACKOFF_MAX_MS")).unwrap_or(default_max);

        Self {
            max_attempts: max_attempts.max(1),
            backoff: BackoffPolicy::from_millis_pair(base_ms, max_ms),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Prefix for every queue key
    pub key_prefix: String,
    pub retention: Retention,
    pub upload: StageOptions,
    pub summarize: StageOptions,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "vsum".to_string(),
            retention: Retention::default(),
            upload: StageOptions::upload_default(),
            summarize: StageOptions::summarize_default(),
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Retention::default();
        Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            key_prefix: std::env::var("QUEUE_KEY_PREFIX").unwrap_or_else(|_| "vsum".to_string()),
            retention: Retention {
                completed: env_parse("QUEUE_KEEP_COMPLETED").unwrap_or(defaults.completed),
                dead_lettered: env_parse("QUEUE_KEEP_DEAD_LETTERED")
                    .unwrap_or(defaults.dead_lettered),
                completed_ttl: env_parse("QUEUE_COMPLETED_TTL_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.completed_ttl),
                dead_lettered_ttl: env_parse("QUEUE_DEAD_LETTERED_TTL_SECS")
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.dead_lettered_ttl),
            },
            upload: StageOptions::from_env("QUEUE_UPLOAD", StageOptions::upload_default()),
            summarize: StageOptions::from_env("QUEUE_SUMMARIZE", StageOptions::summarize_default()),
        }
    }

    /// Options for one stage.
    pub fn stage(&self, stage: Stage) -> StageOptions {
        match stage {
            Stage::Upload => self.upload,
            Stage::Summarize => self.summarize,
        }
    }
}

/// Job queue client.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    config: QueueConfig,
}

impl JobQueue {
    /// Create a queue over any store.
    pub fn new(store: Arc<dyn JobStore>, config: QueueConfig) -> Self {
        Self { store, config }
    }

    /// Redis-backed queue from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        let config = QueueConfig::from_env();
        let store = RedisJobStore::new(&config.redis_url, config.key_prefix.clone())?
            .with_retention(config.retention);
        info!(prefix = %config.key_prefix, "Using Redis job store");
        Ok(Self::new(Arc::new(store), config))
    }

    /// In-process queue with default stage options.
    pub fn memory() -> Self {
        let config = QueueConfig::default();
        let store = MemoryJobStore::new().with_retention(config.retention);
        Self::new(Arc::new(store), config)
    }

    /// Get the queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Get the underlying store.
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Enqueue an upload job.
    pub async fn enqueue_upload(&self, job: UploadJobPayload) -> QueueResult<JobId> {
        self.enqueue(QueueJob::Upload(job)).await
    }

    /// Enqueue a summarize job, deduplicated per (owner, video).
    pub async fn enqueue_summarize(&self, job: SummarizeJobPayload) -> QueueResult<JobId> {
        self.enqueue(QueueJob::Summarize(job)).await
    }

    /// Enqueue a job on its stage's stream with that stage's options.
    pub async fn enqueue(&self, job: QueueJob) -> QueueResult<JobId> {
        let stage = job.stage();
        let mut options = self.config.stage(stage).enqueue_options();
        options.dedup_key = job.dedup_key();
        self.store.enqueue(stage.stream(), job, options).await
    }

    /// Claim the next ready job of a stage for `duration`.
    pub async fn lease(&self, stage: Stage, duration: Duration) -> QueueResult<Option<Lease>> {
        self.store.lease(stage.stream(), duration).await
    }

    /// Acknowledge a job (mark as completed). Stale leases are `LeaseLost`.
    pub async fn ack(&self, lease: &Lease) -> QueueResult<()> {
        self.store.ack(lease).await
    }

    /// Record a failed execution; retries with backoff or dead-letters.
    pub async fn fail(
        &self,
        lease: &Lease,
        kind: FailureKind,
        message: &str,
    ) -> QueueResult<FailOutcome> {
        self.store.fail(lease, kind, message).await
    }

    /// Get a job record by id.
    pub async fn get(&self, id: &JobId) -> QueueResult<Option<JobRecord>> {
        self.store.get(id).await
    }

    /// Get per-status counts for a stage.
    pub async fn stats(&self, stage: Stage) -> QueueResult<QueueStats> {
        self.store.stats(stage.stream()).await
    }

    /// List dead-lettered jobs of a stage, most recent first.
    pub async fn dead_letters(&self, stage: Stage, limit: usize) -> QueueResult<Vec<JobRecord>> {
        self.store.dead_letters(stage.stream(), limit).await
    }

    /// Manually re-enqueue a dead-lettered job.
    pub async fn redrive(&self, id: &JobId) -> QueueResult<bool> {
        self.store.redrive(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::NotificationContext;
    use vsum_models::VideoId;

    fn summarize_job(video_id: VideoId) -> SummarizeJobPayload {
        SummarizeJobPayload {
            video_id,
            owner_id: "user_1".into(),
            notification_context: NotificationContext {
                video_title: "Talk".into(),
                bucket: "videos".into(),
                media_key: "talk-1.mp4".into(),
                file_name: "talk.mp4".into(),
                mime_type: "video/mp4".into(),
            },
        }
    }

    #[tokio::test]
    async fn stage_options_are_applied() {
        let queue = JobQueue::memory();
        let upload = queue
            .enqueue_upload(UploadJobPayload::new("u", "t", "f.mp4", "video/mp4", vec![1]))
            .await
            .unwrap();
        let summarize = queue.enqueue_summarize(summarize_job(VideoId::new())).await.unwrap();

        let upload = queue.get(&upload).await.unwrap().unwrap();
        assert_eq!(upload.stream, "upload");
        assert_eq!(upload.max_attempts, 5);
        assert_eq!(upload.backoff, BackoffPolicy::Immediate);

        let summarize = queue.get(&summarize).await.unwrap().unwrap();
        assert_eq!(summarize.stream, "summarize");
        assert_eq!(summarize.max_attempts, 3);
        assert_eq!(summarize.backoff, StageOptions::summarize_default().backoff);
    }

    #[tokio::test]
    async fn summarize_is_deduplicated_per_video() {
        let queue = JobQueue::memory();
        let video_id = VideoId::new();

        let a = queue.enqueue_summarize(summarize_job(video_id)).await.unwrap();
        let b = queue.enqueue_summarize(summarize_job(video_id)).await.unwrap();
        let c = queue.enqueue_summarize(summarize_job(VideoId::new())).await.unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(queue.stats(Stage::Summarize).await.unwrap().pending, 2);
    }

    #[test]
    fn stage_lookup() {
        let config = QueueConfig::default();
        assert_eq!(config.stage(Stage::Upload).max_attempts, 5);
        assert_eq!(config.stage(Stage::Summarize).max_attempts, 3);
    }
}
