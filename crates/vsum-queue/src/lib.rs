//! Durable job queue for the pipeline stages.
//!
//! This crate provides:
//! - Leased delivery with per-job attempt limits and backoff
//! - Dead-lettering with manual redrive
//! - Redis and in-memory backends behind [`JobStore`]
//! - A typed [`JobQueue`] facade for the upload and summarize stages

pub mod clock;
pub mod error;
pub mod job;
pub mod memory;
pub mod metrics;
pub mod policy;
pub mod queue;
pub mod redis_store;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{QueueError, QueueResult};
pub use job::{NotificationContext, QueueJob, SummarizeJobPayload, UploadJobPayload};
pub use memory::MemoryJobStore;
pub use policy::{BackoffPolicy, EnqueueOptions, FailOutcome, FailureKind};
pub use queue::{JobQueue, QueueConfig, StageOptions};
pub use redis_store::RedisJobStore;
pub use store::{JobRecord, JobStore, Lease, LeaseInfo, QueueStats, Retention, LEASE_EXPIRED};
