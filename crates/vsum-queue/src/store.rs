//! Job records and the storage trait both backends implement.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vsum_models::{JobId, JobStatus};

use crate::clock::add_std;
use crate::error::QueueResult;
use crate::job::QueueJob;
use crate::policy::{BackoffPolicy, EnqueueOptions, FailOutcome, FailureKind};

/// Error recorded when an expired lease is reclaimed.
pub const LEASE_EXPIRED: &str = "lease expired";

/// Current holder of a leased job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseInfo {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Everything the queue knows about one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub stream: String,
    pub payload: QueueJob,
    /// Failed executions so far (including reclaimed leases).
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub lease: Option<LeaseInfo>,
    pub last_error: Option<String>,
    pub dedup_key: Option<String>,
}

impl JobRecord {
    pub fn new(
        stream: impl Into<String>,
        payload: QueueJob,
        options: &EnqueueOptions,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            stream: stream.into(),
            payload,
            attempts: 0,
            max_attempts: options.max_attempts.max(1),
            backoff: options.backoff,
            status: JobStatus::Pending,
            created_at: now,
            available_at: now,
            updated_at: now,
            lease: None,
            last_error: None,
            dedup_key: options.dedup_key.clone(),
        }
    }

    /// Leasable right now.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status.is_leasable() && self.available_at <= now
    }

    /// Leased, and the lease ran out.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Leased
            && self.lease.as_ref().is_some_and(|l| l.expires_at <= now)
    }

    /// Whether `token` identifies the current lease.
    pub fn holds(&self, token: &str) -> bool {
        self.status == JobStatus::Leased && self.lease.as_ref().is_some_and(|l| l.token == token)
    }

    pub(crate) fn grant_lease(&mut self, token: String, now: DateTime<Utc>, duration: Duration) {
        self.status = JobStatus::Leased;
        self.lease = Some(LeaseInfo {
            token,
            expires_at: add_std(now, duration),
        });
        self.updated_at = now;
    }

    pub(crate) fn complete(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.lease = None;
        self.updated_at = now;
    }

    /// Record one failed execution. Terminal failures and the failure that
    /// reaches `max_attempts` dead-letter the job.
    pub(crate) fn record_failure(
        &mut self,
        kind: FailureKind,
        message: &str,
        now: DateTime<Utc>,
    ) -> FailOutcome {
        self.attempts = (self.attempts + 1).min(self.max_attempts);
        self.lease = None;
        self.last_error = Some(message.to_string());
        self.updated_at = now;

        if kind == FailureKind::Terminal || self.attempts >= self.max_attempts {
            self.status = JobStatus::DeadLettered;
            return FailOutcome::DeadLettered {
                attempts: self.attempts,
            };
        }

        self.status = JobStatus::Failed;
        self.available_at = add_std(now, self.backoff.delay(self.attempts));
        FailOutcome::Retrying {
            attempt: self.attempts,
            available_at: self.available_at,
        }
    }

    /// Treat an expired lease as a crashed attempt. The job is leasable again
    /// immediately unless that attempt was its last.
    pub(crate) fn reclaim(&mut self, now: DateTime<Utc>) -> FailOutcome {
        let outcome = self.record_failure(FailureKind::Retryable, LEASE_EXPIRED, now);
        if let FailOutcome::Retrying { attempt, .. } = outcome {
            self.status = JobStatus::Pending;
            self.available_at = now;
            return FailOutcome::Retrying {
                attempt,
                available_at: now,
            };
        }
        outcome
    }

    /// Reset a dead-lettered job to a fresh pending one.
    pub(crate) fn redrive(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.attempts = 0;
        self.available_at = now;
        self.updated_at = now;
        self.lease = None;
    }
}

/// A claimed job. Pass it back to `ack` or `fail`.
#[derive(Debug, Clone)]
pub struct Lease {
    pub job: JobRecord,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn job_id(&self) -> &JobId {
        &self.job.id
    }

    /// 1-based number of the execution this lease represents.
    pub fn attempt(&self) -> u32 {
        self.job.attempts + 1
    }
}

/// Per-stream counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Waiting to run, including failed jobs in backoff.
    pub pending: u64,
    pub leased: u64,
    pub dead_lettered: u64,
    pub completed: u64,
}

/// How many finished jobs to keep per stream, and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    pub completed: usize,
    pub dead_lettered: usize,
    pub completed_ttl: Duration,
    pub dead_lettered_ttl: Duration,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            completed: 1000,
            dead_lettered: 1000,
            completed_ttl: Duration::from_secs(24 * 3600),
            dead_lettered_ttl: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Durable job storage with leasing.
///
/// A job is handed to at most one holder at a time. A holder that neither
/// acks nor fails before its lease expires loses the job to reclaim.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a job. Returns the existing id if `dedup_key` matches a live job.
    async fn enqueue(
        &self,
        stream: &str,
        payload: QueueJob,
        options: EnqueueOptions,
    ) -> QueueResult<JobId>;

    /// Claim the oldest ready job on `stream`.
    async fn lease(&self, stream: &str, duration: Duration) -> QueueResult<Option<Lease>>;

    /// Mark the leased job completed.
    async fn ack(&self, lease: &Lease) -> QueueResult<()>;

    /// Record a failed execution of the leased job.
    async fn fail(&self, lease: &Lease, kind: FailureKind, message: &str)
        -> QueueResult<FailOutcome>;

    async fn get(&self, id: &JobId) -> QueueResult<Option<JobRecord>>;

    async fn stats(&self, stream: &str) -> QueueResult<QueueStats>;

    /// Most recent dead-lettered jobs, newest first.
    async fn dead_letters(&self, stream: &str, limit: usize) -> QueueResult<Vec<JobRecord>>;

    /// Re-enqueue a dead-lettered job. Returns false if it isn't dead-lettered.
    async fn redrive(&self, id: &JobId) -> QueueResult<bool>;
}
