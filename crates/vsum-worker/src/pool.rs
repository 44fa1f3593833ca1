//! Per-stage worker pool.
//!
//! Each pool runs `concurrency` independent lease/execute/ack loops against
//! one stage's stream. A handler runs under the job deadline with panics
//! caught; whatever happens is turned into exactly one `ack` or `fail`.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn, Instrument};
use vsum_models::Stage;
use vsum_queue::{FailOutcome, FailureKind, JobQueue, Lease};

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics;
use crate::stages::JobHandler;
use crate::tracker::FailureTracker;

/// Settings for one stage's pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub concurrency: usize,
    pub job_timeout: Duration,
    pub lease_grace: Duration,
    pub poll_interval: Duration,
    pub poll_jitter: Duration,
    pub shutdown_timeout: Duration,
}

impl PoolConfig {
    pub fn for_stage(config: &WorkerConfig, stage: Stage) -> Self {
        Self {
            concurrency: match stage {
                Stage::Upload => config.upload_concurrency,
                Stage::Summarize => config.summarize_concurrency,
            }
            .max(1),
            job_timeout: config.job_timeout,
            lease_grace: config.lease_grace,
            poll_interval: config.poll_interval,
            poll_jitter: config.poll_jitter,
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    /// Lease length for a job: the deadline plus grace, so a live handler is
    /// always cut off before its lease lapses.
    pub fn lease_duration(&self) -> Duration {
        self.job_timeout + self.lease_grace
    }
}

/// Pool of loops serving one stage.
pub struct WorkerPool {
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    config: PoolConfig,
}

impl WorkerPool {
    pub fn new(queue: JobQueue, handler: Arc<dyn JobHandler>, config: PoolConfig) -> Self {
        Self {
            queue,
            handler,
            config,
        }
    }

    pub fn stage(&self) -> Stage {
        self.handler.stage()
    }

    /// Run until `shutdown` flips to true, then let in-flight jobs finish
    /// within `shutdown_timeout`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let stage = self.stage();
        info!(
            stage = %stage,
            concurrency = self.config.concurrency,
            lease_secs = self.config.lease_duration().as_secs(),
            "Starting worker pool"
        );

        let mut loops = JoinSet::new();
        for index in 0..self.config.concurrency {
            loops.spawn(Arc::clone(&self).worker_loop(index, shutdown.clone()));
        }

        // A dropped sender counts as shutdown too.
        let _ = shutdown.wait_for(|stop| *stop).await;
        info!(stage = %stage, "Shutdown signal received, draining in-flight jobs");

        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            while loops.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                stage = %stage,
                "In-flight jobs did not finish within {:?}; their leases will expire",
                self.config.shutdown_timeout
            );
            loops.abort_all();
        }
        info!(stage = %stage, "Worker pool stopped");
    }

    async fn worker_loop(self: Arc<Self>, index: usize, mut shutdown: watch::Receiver<bool>) {
        let mut poll_failures = FailureTracker::new("lease", 3);
        debug!(stage = %self.stage(), index, "Worker loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_once().await {
                Ok(true) => {
                    poll_failures.record_success();
                    continue;
                }
                Ok(false) => poll_failures.record_success(),
                Err(e) => {
                    if poll_failures.record_failure() {
                        warn!(stage = %self.stage(), index, error = %e, "Failed to lease job");
                    }
                }
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.idle_delay()) => {}
            }
        }
        debug!(stage = %self.stage(), index, "Worker loop stopped");
    }

    fn idle_delay(&self) -> Duration {
        let jitter_ms = self.config.poll_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=jitter_ms)
        };
        self.config.poll_interval + Duration::from_millis(jitter)
    }

    /// Lease and execute one job. Returns false when the stream had nothing
    /// ready. Only queue errors from leasing surface here.
    pub async fn run_once(&self) -> WorkerResult<bool> {
        let lease = self
            .queue
            .lease(self.stage(), self.config.lease_duration())
            .await?;

        match lease {
            Some(lease) => {
                self.execute(lease).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn execute(&self, lease: Lease) {
        let stage = self.stage();
        let logger = JobLogger::new(lease.job_id(), stage, lease.attempt());
        logger.log_start(&format!(
            "attempt {}/{}",
            lease.attempt(),
            lease.job.max_attempts
        ));
        metrics::record_job_started(stage);

        let started = Instant::now();
        let handled = AssertUnwindSafe(self.handler.handle(&lease, &logger))
            .catch_unwind()
            .instrument(logger.create_span());

        let result = match tokio::time::timeout(self.config.job_timeout, handled).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => {
                metrics::record_job_panicked(stage);
                Err(WorkerError::panicked(panic_message(panic.as_ref())))
            }
            Err(_) => {
                metrics::record_job_timed_out(stage);
                Err(WorkerError::Timeout(self.config.job_timeout))
            }
        };
        metrics::record_job_duration(stage, started.elapsed());

        match result {
            Ok(()) => self.complete(&lease, &logger).await,
            Err(e) => self.fail(&lease, &logger, e).await,
        }
    }

    async fn complete(&self, lease: &Lease, logger: &JobLogger) {
        match self.queue.ack(lease).await {
            Ok(()) => {
                metrics::record_job_completed(self.stage());
                logger.log_completion("acked");
            }
            Err(e) if e.is_lease_lost() => {
                logger.log_warning("lease lost before ack; the job will run again");
            }
            Err(e) => logger.log_error(&format!("failed to ack: {e}")),
        }
    }

    async fn fail(&self, lease: &Lease, logger: &JobLogger, error: WorkerError) {
        let kind = error.failure_kind();
        let message = error.to_string();
        metrics::record_job_failed(self.stage(), kind);

        match kind {
            FailureKind::Terminal => logger.log_error(&message),
            FailureKind::Retryable => logger.log_warning(&message),
        }

        match self.queue.fail(lease, kind, &message).await {
            Ok(FailOutcome::Retrying {
                attempt,
                available_at,
            }) => logger.log_progress(&format!(
                "attempt {attempt} failed; retrying at {available_at}"
            )),
            Ok(FailOutcome::DeadLettered { attempts }) => {
                logger.log_error(&format!("dead-lettered after {attempts} attempt(s)"))
            }
            Err(e) if e.is_lease_lost() => {
                logger.log_warning("lease lost before fail; the job was already reclaimed")
            }
            Err(e) => logger.log_error(&format!("failed to record failure: {e}")),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use vsum_models::JobStatus;
    use vsum_queue::{QueueJob, UploadJobPayload};

    enum Behavior {
        Succeed,
        Fail(fn() -> WorkerError),
        Panic,
        Hang,
    }

    struct TestHandler {
        behavior: Behavior,
        calls: AtomicU32,
    }

    impl TestHandler {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl JobHandler for TestHandler {
        fn stage(&self) -> Stage {
            Stage::Upload
        }

        async fn handle(&self, _lease: &Lease, _log: &JobLogger) -> WorkerResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Succeed => Ok(()),
                Behavior::Fail(make) => Err(make()),
                Behavior::Panic => panic!("boom"),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(())
                }
            }
        }
    }

    fn config() -> PoolConfig {
        PoolConfig {
            concurrency: 1,
            job_timeout: Duration::from_secs(5),
            lease_grace: Duration::from_secs(1),
            poll_interval: Duration::from_millis(10),
            poll_jitter: Duration::ZERO,
            shutdown_timeout: Duration::from_secs(5),
        }
    }

    async fn enqueue(queue: &JobQueue) -> vsum_models::JobId {
        queue
            .enqueue_upload(UploadJobPayload::new(
                "u1",
                "Talk",
                "talk.mp4",
                "video/mp4",
                b"bytes".to_vec(),
            ))
            .await
            .unwrap()
    }

    #[test]
    fn lease_outlives_the_deadline() {
        let config = PoolConfig::for_stage(&WorkerConfig::default(), Stage::Summarize);
        assert!(config.lease_duration() > config.job_timeout);
        assert_eq!(config.concurrency, 2);
    }

    #[tokio::test]
    async fn success_acks() {
        let queue = JobQueue::memory();
        let id = enqueue(&queue).await;
        let pool = WorkerPool::new(queue.clone(), TestHandler::new(Behavior::Succeed), config());

        assert!(pool.run_once().await.unwrap());
        assert!(!pool.run_once().await.unwrap());
        let record = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn terminal_error_dead_letters_at_once() {
        let queue = JobQueue::memory();
        let id = enqueue(&queue).await;
        let handler = TestHandler::new(Behavior::Fail(|| WorkerError::EmptyPayload));
        let pool = WorkerPool::new(queue.clone(), handler.clone(), config());

        pool.run_once().await.unwrap();
        let record = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::DeadLettered);
        assert_eq!(record.attempts, 1);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panic_is_a_retryable_failure() {
        let queue = JobQueue::memory();
        let id = enqueue(&queue).await;
        let pool = WorkerPool::new(queue.clone(), TestHandler::new(Behavior::Panic), config());

        assert!(pool.run_once().await.unwrap());
        let record = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.attempts, 1);
        assert!(record.last_error.unwrap().contains("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cancels_the_handler() {
        let queue = JobQueue::memory();
        let id = enqueue(&queue).await;
        let pool = WorkerPool::new(queue.clone(), TestHandler::new(Behavior::Hang), config());

        pool.run_once().await.unwrap();
        let record = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(record.attempts, 1);
        assert!(record.last_error.unwrap().contains("Deadline exceeded"));
    }

    #[tokio::test]
    async fn run_drains_and_stops_on_shutdown() {
        let queue = JobQueue::memory();
        for _ in 0..3 {
            enqueue(&queue).await;
        }
        let handler = TestHandler::new(Behavior::Succeed);
        let pool = Arc::new(WorkerPool::new(
            queue.clone(),
            handler.clone(),
            PoolConfig {
                concurrency: 2,
                ..config()
            },
        ));

        let (tx, rx) = watch::channel(false);
        let running = tokio::spawn(Arc::clone(&pool).run(rx));

        for _ in 0..100 {
            if queue.stats(Stage::Upload).await.unwrap().completed == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(true).unwrap();
        running.await.unwrap();

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.stats(Stage::Upload).await.unwrap().completed, 3);
    }
}
