//! Upload stage: persist media, create the video row, queue summarization.

use std::sync::Arc;

use async_trait::async_trait;
use vsum_db::VideoRepository;
use vsum_models::{NewVideo, Stage};
use vsum_queue::{
    JobQueue, Lease, NotificationContext, QueueJob, SummarizeJobPayload, UploadJobPayload,
};
use vsum_storage::{generate_object_key, ObjectStore};

use super::JobHandler;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;

pub struct UploadHandler {
    queue: JobQueue,
    store: Arc<dyn ObjectStore>,
    videos: Arc<dyn VideoRepository>,
    bucket: String,
    allowed_mime_types: Vec<String>,
}

impl UploadHandler {
    pub fn new(
        queue: JobQueue,
        store: Arc<dyn ObjectStore>,
        videos: Arc<dyn VideoRepository>,
        bucket: impl Into<String>,
        allowed_mime_types: Vec<String>,
    ) -> Self {
        Self {
            queue,
            store,
            videos,
            bucket: bucket.into(),
            allowed_mime_types,
        }
    }

    fn validate(&self, job: &UploadJobPayload) -> WorkerResult<()> {
        let mime = job.mime_type.trim().to_lowercase();
        if !self.allowed_mime_types.iter().any(|allowed| *allowed == mime) {
            return Err(WorkerError::InvalidMimeType(job.mime_type.clone()));
        }
        if job.raw_bytes.is_empty() {
            return Err(WorkerError::EmptyPayload);
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for UploadHandler {
    fn stage(&self) -> Stage {
        Stage::Upload
    }

    async fn handle(&self, lease: &Lease, log: &JobLogger) -> WorkerResult<()> {
        let QueueJob::Upload(job) = &lease.job.payload else {
            return Err(WorkerError::UnexpectedPayload("upload"));
        };
        self.validate(job)?;

        // Keyed by job, so a retry overwrites the object it already wrote.
        let key = generate_object_key(&job.file_name, lease.job_id().as_str());
        let media_url = self
            .store
            .put(&self.bucket, &key, job.raw_bytes.clone(), &job.mime_type)
            .await?;
        log.log_progress(&format!("stored {} bytes at {}", job.raw_bytes.len(), key));

        let inserted = self
            .videos
            .insert_idempotent(NewVideo {
                owner_id: job.owner_id.clone(),
                title: job.title.clone(),
                description: job.description.clone(),
                thumbnail_url: job.thumbnail_url.clone(),
                media_url,
                media_key: key,
                mime_type: job.mime_type.clone(),
                file_name: job.file_name.clone(),
                upload_key: format!("upload:{}", lease.job_id()),
            })
            .await?;
        let video = inserted.video;
        if !inserted.created {
            log.log_warning(&format!("video {} already existed; reusing it", video.id));
        }

        let summarize_id = self
            .queue
            .enqueue_summarize(SummarizeJobPayload {
                video_id: video.id,
                owner_id: video.owner_id.clone(),
                notification_context: NotificationContext {
                    video_title: video.title.clone(),
                    bucket: self.bucket.clone(),
                    media_key: video.media_key.clone(),
                    file_name: video.file_name.clone(),
                    mime_type: video.mime_type.clone(),
                },
            })
            .await?;
        log.log_progress(&format!(
            "video {} queued for summarization as {}",
            video.id, summarize_id
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use vsum_db::{DbError, DbResult, Inserted, MemoryVideoRepository};
    use vsum_models::{JobStatus, SummaryBlob, VideoId, VideoMetadata};
    use vsum_storage::MemoryObjectStore;

    use crate::pool::{PoolConfig, WorkerPool};

    /// Fails the first `failures` inserts with a pool timeout.
    struct FlakyInserts {
        inner: MemoryVideoRepository,
        failures: AtomicU32,
    }

    #[async_trait]
    impl VideoRepository for FlakyInserts {
        async fn insert_idempotent(&self, video: NewVideo) -> DbResult<Inserted> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(DbError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.insert_idempotent(video).await
        }

        async fn get(&self, id: &VideoId) -> DbResult<Option<VideoMetadata>> {
            self.inner.get(id).await
        }

        async fn mark_summarized(
            &self,
            id: &VideoId,
            summary: &SummaryBlob,
        ) -> DbResult<VideoMetadata> {
            self.inner.mark_summarized(id, summary).await
        }
    }

    fn fixture(
        insert_failures: u32,
    ) -> (JobQueue, Arc<MemoryObjectStore>, Arc<FlakyInserts>, UploadHandler) {
        let queue = JobQueue::memory();
        let store = Arc::new(MemoryObjectStore::with_bucket("videos"));
        let videos = Arc::new(FlakyInserts {
            inner: MemoryVideoRepository::new(),
            failures: AtomicU32::new(insert_failures),
        });
        let handler = UploadHandler::new(
            queue.clone(),
            store.clone(),
            videos.clone(),
            "videos",
            vec!["video/mp4".to_string()],
        );
        (queue, store, videos, handler)
    }

    fn upload() -> UploadJobPayload {
        UploadJobPayload::new("u1", "Talk", "talk.mp4", "video/mp4", b"bytes".to_vec())
    }

    #[tokio::test]
    async fn retry_after_failed_insert_reuses_the_object() {
        let (queue, store, videos, handler) = fixture(1);
        let id = queue.enqueue_upload(upload()).await.unwrap();
        let pool = WorkerPool::new(
            queue.clone(),
            Arc::new(handler),
            PoolConfig {
                concurrency: 1,
                job_timeout: Duration::from_secs(5),
                lease_grace: Duration::from_secs(1),
                poll_interval: Duration::from_millis(10),
                poll_jitter: Duration::ZERO,
                shutdown_timeout: Duration::from_secs(5),
            },
        );

        assert!(pool.run_once().await.unwrap());
        assert!(pool.run_once().await.unwrap());

        let record = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.attempts, 1);
        assert_eq!(videos.inner.len(), 1);
        assert_eq!(store.object_count(), 1);
    }

    #[tokio::test]
    async fn replayed_job_creates_nothing_new() {
        let (queue, store, videos, handler) = fixture(0);
        queue.enqueue_upload(upload()).await.unwrap();
        let lease = queue
            .lease(Stage::Upload, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        let log = JobLogger::new(lease.job_id(), Stage::Upload, lease.attempt());

        // Second run stands in for a redelivery after a crash before ack.
        handler.handle(&lease, &log).await.unwrap();
        handler.handle(&lease, &log).await.unwrap();
        queue.ack(&lease).await.unwrap();

        let all = videos.inner.all();
        assert_eq!(all.len(), 1);
        assert_eq!(store.object_count(), 1);
        assert_eq!(
            all[0].media_key,
            generate_object_key("talk.mp4", lease.job_id().as_str())
        );
        assert_eq!(queue.stats(Stage::Summarize).await.unwrap().pending, 1);
    }
}
