//! Wiring of both stage pools over one set of backends.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;
use vsum_db::VideoRepository;
use vsum_ml_client::{Summarizer, Transcriber};
use vsum_models::Stage;
use vsum_notify::{NotificationLog, PushPublisher};
use vsum_queue::JobQueue;
use vsum_storage::ObjectStore;

use crate::config::WorkerConfig;
use crate::pool::{PoolConfig, WorkerPool};
use crate::stages::{summarizer_rate_limiter, SummarizeHandler, UploadHandler};

/// Backends the stage handlers talk to.
#[derive(Clone)]
pub struct Services {
    pub queue: JobQueue,
    pub store: Arc<dyn ObjectStore>,
    pub videos: Arc<dyn VideoRepository>,
    pub transcriber: Arc<dyn Transcriber>,
    pub summarizer: Arc<dyn Summarizer>,
    pub notifications: Arc<dyn NotificationLog>,
    pub push: Arc<dyn PushPublisher>,
}

/// The upload and summarize pools of one worker process.
pub struct Pipeline {
    pub upload: Arc<WorkerPool>,
    pub summarize: Arc<WorkerPool>,
}

impl Pipeline {
    pub fn new(config: &WorkerConfig, services: Services) -> Self {
        let upload = UploadHandler::new(
            services.queue.clone(),
            Arc::clone(&services.store),
            Arc::clone(&services.videos),
            config.bucket.clone(),
            config.allowed_mime_types.clone(),
        );

        let summarize = SummarizeHandler::new(
            services.store,
            services.videos,
            services.transcriber,
            services.summarizer,
            services.notifications,
            services.push,
            summarizer_rate_limiter(config.summarizer_rate_per_minute),
        );

        Self {
            upload: Arc::new(WorkerPool::new(
                services.queue.clone(),
                Arc::new(upload),
                PoolConfig::for_stage(config, Stage::Upload),
            )),
            summarize: Arc::new(WorkerPool::new(
                services.queue,
                Arc::new(summarize),
                PoolConfig::for_stage(config, Stage::Summarize),
            )),
        }
    }

    /// Run both pools until `shutdown` flips, then wait for both to drain.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let upload = Arc::clone(&self.upload).run(shutdown.clone());
        let summarize = Arc::clone(&self.summarize).run(shutdown);
        tokio::join!(upload, summarize);
        info!("All worker pools stopped");
    }
}
