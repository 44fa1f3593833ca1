//! Structured job logging.
//!
//! Every lifecycle line for a job carries the same `job_id`, `stage` and
//! `attempt` fields so a job's history can be filtered out of the stream.

use tracing::{error, info, warn, Span};
use vsum_models::{JobId, Stage};

/// Job logger with the job's identifying fields attached.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    stage: Stage,
    attempt: u32,
}

impl JobLogger {
    /// Create a logger for one execution of a job.
    ///
    /// `attempt` is the 1-based execution number the lease was granted for.
    pub fn new(job_id: &JobId, stage: Stage, attempt: u32) -> Self {
        Self {
            job_id: job_id.to_string(),
            stage,
            attempt,
        }
    }

    /// Log the start of a job execution.
    pub fn log_start(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            stage = %self.stage,
            attempt = self.attempt,
            "Job started: {}", message
        );
    }

    /// Log a progress update during job execution.
    pub fn log_progress(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            stage = %self.stage,
            attempt = self.attempt,
            "Job progress: {}", message
        );
    }

    /// Log a warning during job execution.
    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            stage = %self.stage,
            attempt = self.attempt,
            "Job warning: {}", message
        );
    }

    /// Log an error during job execution.
    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            stage = %self.stage,
            attempt = self.attempt,
            "Job error: {}", message
        );
    }

    /// Log the completion of a job execution.
    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            stage = %self.stage,
            attempt = self.attempt,
            "Job completed: {}", message
        );
    }

    /// Get the job ID.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Get the stage the job belongs to.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Get the attempt number.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Span carrying the job fields, for instrumenting the handler future.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            stage = %self.stage,
            attempt = self.attempt
        )
    }
}
