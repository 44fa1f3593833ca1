//! HTTP clients for the ML services used by the summarize stage.
//!
//! - [`WhisperClient`]: speech-to-text, guarded by a [`CircuitBreaker`]
//! - [`GeminiClient`]: transcript summarization

pub mod breaker;
pub mod error;
pub mod gemini;
pub mod retry;
pub mod traits;
pub mod whisper;

pub use breaker::{CircuitBreaker, CircuitState, Permit};
pub use error::{MlError, MlResult};
pub use gemini::{GeminiClient, GeminiConfig};
pub use retry::{retry_if, RetryConfig};
pub use traits::{SummaryResult, Summarizer, Transcriber};
pub use whisper::{WhisperClient, WhisperConfig};
