//! Summarize stage: transcribe, summarize, store, notify.

use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use vsum_db::VideoRepository;
use vsum_ml_client::{Summarizer, Transcriber};
use vsum_models::{summary_notification_key, PushEvent, Stage, VideoMetadata};
use vsum_notify::{NotificationLog, PushPublisher};
use vsum_queue::{Lease, QueueJob, SummarizeJobPayload};
use vsum_storage::ObjectStore;

use super::JobHandler;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics;

/// Limiter shared by every summarize loop in the process.
pub type SummarizerRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Build the summarizer limiter. Zero falls back to one call per minute.
pub fn summarizer_rate_limiter(per_minute: u32) -> Arc<SummarizerRateLimiter> {
    let rate = NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN);
    Arc::new(RateLimiter::direct(Quota::per_minute(rate)))
}

/// Notification text for a finished video.
pub fn summary_ready_message(title: &str) -> String {
    format!("Summary ready for \"{}\"", title)
}

pub struct SummarizeHandler {
    store: Arc<dyn ObjectStore>,
    videos: Arc<dyn VideoRepository>,
    transcriber: Arc<dyn Transcriber>,
    summarizer: Arc<dyn Summarizer>,
    notifications: Arc<dyn NotificationLog>,
    push: Arc<dyn PushPublisher>,
    limiter: Arc<SummarizerRateLimiter>,
}

impl SummarizeHandler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        videos: Arc<dyn VideoRepository>,
        transcriber: Arc<dyn Transcriber>,
        summarizer: Arc<dyn Summarizer>,
        notifications: Arc<dyn NotificationLog>,
        push: Arc<dyn PushPublisher>,
        limiter: Arc<SummarizerRateLimiter>,
    ) -> Self {
        Self {
            store,
            videos,
            transcriber,
            summarizer,
            notifications,
            push,
            limiter,
        }
    }

    async fn summarize_video(
        &self,
        job: &SummarizeJobPayload,
        video: VideoMetadata,
        log: &JobLogger,
    ) -> WorkerResult<VideoMetadata> {
        let bucket = &job.notification_context.bucket;
        let media = self.store.get(bucket, &video.media_key).await?;
        log.log_progress(&format!("fetched {} bytes of media", media.len()));

        let transcript = self
            .transcriber
            .transcribe(&media, &video.file_name, &video.mime_type)
            .await?;
        log.log_progress(&format!(
            "transcribed {} segment(s)",
            transcript.chunks.len()
        ));

        self.limiter.until_ready().await;
        let summary = self.summarizer.summarize(&transcript).await?;
        log.log_progress(&format!("summary has {} key point(s)", summary.key_points.len()));

        let blob = summary.into_blob(transcript);
        self.videos
            .mark_summarized(&video.id, &blob)
            .await
            .map_err(|e| match e {
                vsum_db::DbError::NotFound(id) => WorkerError::VideoNotFound(id),
                other => other.into(),
            })
    }
}

#[async_trait]
impl JobHandler for SummarizeHandler {
    fn stage(&self) -> Stage {
        Stage::Summarize
    }

    async fn handle(&self, lease: &Lease, log: &JobLogger) -> WorkerResult<()> {
        let QueueJob::Summarize(job) = &lease.job.payload else {
            return Err(WorkerError::UnexpectedPayload("summarize"));
        };

        let video = self
            .videos
            .get(&job.video_id)
            .await?
            .ok_or_else(|| WorkerError::VideoNotFound(job.video_id.to_string()))?;

        // A replay after a crash past the update only needs the notification.
        let video = if video.is_summarized {
            log.log_progress("video already summarized; ensuring notification");
            video
        } else {
            self.summarize_video(job, video, log).await?
        };

        let key = summary_notification_key(&job.owner_id, &video.id);
        let message = summary_ready_message(&job.notification_context.video_title);
        let appended = self
            .notifications
            .append(&job.owner_id, &key, &message, Some(video.id))
            .await?;

        if !appended.created {
            log.log_progress("notification already recorded");
            return Ok(());
        }
        metrics::record_notification_created();

        // Live delivery is best effort; the log is the durable record.
        let event = PushEvent::notification(appended.notification);
        match self.push.publish(&job.owner_id, &event).await {
            Ok(receivers) => log.log_progress(&format!("pushed to {receivers} receiver(s)")),
            Err(e) => {
                metrics::record_push_failure();
                log.log_warning(&format!("push failed: {e}"));
            }
        }
        Ok(())
    }
}
