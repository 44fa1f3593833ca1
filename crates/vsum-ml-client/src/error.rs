//! ML client error types.

use std::time::Duration;

use thiserror::Error;

pub type MlResult<T> = Result<T, MlError>;

#[derive(Debug, Error)]
pub enum MlError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Service returned {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Circuit open; retry in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },

    /// The transcription service produced nothing usable for this media.
    #[error("Invalid transcript: {0}")]
    InvalidTranscript(String),

    /// The summarizer answered, but not in the expected shape.
    #[error("Malformed model output: {0}")]
    MalformedOutput(String),

    /// The summarizer declined to produce a summary.
    #[error("Model refused: {0}")]
    Refused(String),
}

impl MlError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedOutput(msg.into())
    }

    /// Whether the same request could succeed later.
    ///
    /// Timeouts, network errors, 5xx, 429, an open circuit and malformed model
    /// output are transient. 4xx, unusable transcripts and refusals are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            MlError::Timeout(_)
            | MlError::Network(_)
            | MlError::CircuitOpen { .. }
            | MlError::MalformedOutput(_) => true,
            MlError::Http { status, .. } => *status >= 500 || *status == 429,
            MlError::Config(_) | MlError::InvalidTranscript(_) | MlError::Refused(_) => false,
        }
    }
}

impl From<reqwest::Error> for MlError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            MlError::Timeout(e.to_string())
        } else if let Some(status) = e.status() {
            MlError::Http {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else {
            MlError::Network(e.to_string())
        }
    }
}
