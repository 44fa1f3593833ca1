//! Stage handlers.

mod summarize;
mod upload;

use async_trait::async_trait;
use vsum_models::Stage;
use vsum_queue::Lease;

use crate::error::WorkerResult;
use crate::logging::JobLogger;

pub use summarize::{
    summarizer_rate_limiter, summary_ready_message, SummarizeHandler, SummarizerRateLimiter,
};
pub use upload::UploadHandler;

/// Work done for one leased job.
///
/// Handlers may run more than once for the same job, so every side effect
/// must be idempotent. Follow-on jobs are enqueued before returning `Ok`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn stage(&self) -> Stage;

    async fn handle(&self, lease: &Lease, log: &JobLogger) -> WorkerResult<()>;
}
