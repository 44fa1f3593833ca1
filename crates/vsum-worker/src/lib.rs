//! Upload and summarize workers.
//!
//! This crate provides:
//! - Per-stage worker pools with deadlines, panic capture and graceful drain
//! - The upload handler (store media, create the video row, queue summarize)
//! - The summarize handler (transcribe, summarize, persist, notify)

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod pool;
pub mod stages;
pub mod tracker;

pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use logging::JobLogger;
pub use pipeline::{Pipeline, Services};
pub use pool::{PoolConfig, WorkerPool};
pub use stages::{JobHandler, SummarizeHandler, UploadHandler};
pub use tracker::FailureTracker;
