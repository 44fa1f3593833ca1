//! Worker error types.

use std::time::Duration;

use thiserror::Error;
use vsum_ml_client::MlError;
use vsum_queue::FailureKind;
use vsum_storage::StorageError;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Mime type not allowed: {0}")]
    InvalidMimeType(String),

    #[error("Upload payload is empty")]
    EmptyPayload,

    #[error("Video not found: {0}")]
    VideoNotFound(String),

    /// A downstream service looked at the content and refused it.
    #[error("Content rejected: {0}")]
    ContentRejected(String),

    #[error("Job payload does not belong to the {0} stage")]
    UnexpectedPayload(&'static str),

    #[error("Deadline exceeded after {0:?}")]
    Timeout(Duration),

    #[error("Handler panicked: {0}")]
    Panicked(String),

    #[error("ML service error: {0}")]
    Ml(MlError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Db(#[from] vsum_db::DbError),

    #[error("Queue error: {0}")]
    Queue(#[from] vsum_queue::QueueError),

    #[error("Notification error: {0}")]
    Notification(#[from] vsum_notify::NotificationError),
}

impl From<MlError> for WorkerError {
    fn from(e: MlError) -> Self {
        match e {
            MlError::InvalidTranscript(_) | MlError::Refused(_) => {
                Self::ContentRejected(e.to_string())
            }
            MlError::Http { status, .. } if (400..500).contains(&status) && status != 429 => {
                Self::ContentRejected(e.to_string())
            }
            other => Self::Ml(other),
        }
    }
}

impl WorkerError {
    pub fn panicked(msg: impl Into<String>) -> Self {
        Self::Panicked(msg.into())
    }

    /// Classify for the queue: Terminal dead-letters now, Retryable backs off.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            WorkerError::InvalidMimeType(_)
            | WorkerError::EmptyPayload
            | WorkerError::VideoNotFound(_)
            | WorkerError::ContentRejected(_)
            | WorkerError::UnexpectedPayload(_) => FailureKind::Terminal,

            // Missing media, a missing row or bad stored data: no retry fixes it.
            WorkerError::Storage(e) if !e.is_retryable() => FailureKind::Terminal,
            WorkerError::Db(e) if !e.is_retryable() => FailureKind::Terminal,

            WorkerError::Ml(e) if !e.is_retryable() => FailureKind::Terminal,

            WorkerError::Timeout(_)
            | WorkerError::Panicked(_)
            | WorkerError::Ml(_)
            | WorkerError::Storage(_)
            | WorkerError::Db(_)
            | WorkerError::Queue(_)
            | WorkerError::Notification(_) => FailureKind::Retryable,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.failure_kind() == FailureKind::Terminal
    }
}
