//! Job identifiers and lifecycle state.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a queued job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job state in the queue.
///
/// `Failed` is the transient "waiting out a backoff" state; the job becomes
/// leasable again once its `available_at` has passed. `Completed` and
/// `DeadLettered` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting in queue
    #[default]
    Pending,
    /// Held by a worker under a lease
    Leased,
    /// Finished successfully
    Completed,
    /// Failed, will be retried after backoff
    Failed,
    /// Retries exhausted or terminal error
    DeadLettered,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Leased => "leased",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::DeadLettered => "dead_lettered",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::DeadLettered)
    }

    /// Whether a job in this state may be handed to a leaser (subject to `available_at`).
    pub fn is_leasable(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "leased" => Ok(JobStatus::Leased),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "dead_lettered" => Ok(JobStatus::DeadLettered),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Pipeline stage, one job stream per stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Persist raw media and create the video row
    Upload,
    /// Transcribe, summarize and notify
    Summarize,
}

impl Stage {
    pub const ALL: [Stage; 2] = [Stage::Upload, Stage::Summarize];

    /// Stream name used by the queue for this stage.
    pub fn stream(&self) -> &'static str {
        match self {
            Stage::Upload => "upload",
            Stage::Summarize => "summarize",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stream())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leasable_states() {
        assert!(JobStatus::Pending.is_leasable());
        assert!(JobStatus::Failed.is_leasable());
        assert!(!JobStatus::Leased.is_leasable());
        assert!(!JobStatus::DeadLettered.is_leasable());
        assert!(JobStatus::DeadLettered.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&JobStatus::DeadLettered).unwrap();
        assert_eq!(json, "\"dead_lettered\"");
    }
}
