//! Narrow interfaces the worker depends on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use vsum_models::{KeyPoint, SummaryBlob, Transcript};

use crate::error::MlResult;

/// Speech-to-text over raw media bytes.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe `media`, sent with its original file name and MIME type.
    async fn transcribe(
        &self,
        media: &[u8],
        file_name: &str,
        mime_type: &str,
    ) -> MlResult<Transcript>;
}

/// What the summarizer extracts from a transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryResult {
    pub summary: String,
    pub key_points: Vec<KeyPoint>,
    pub keywords: Vec<String>,
}

impl SummaryResult {
    /// Attach the transcript the summary was made from.
    pub fn into_blob(self, transcript: Transcript) -> SummaryBlob {
        SummaryBlob {
            summary: self.summary,
            key_points: self.key_points,
            keywords: self.keywords,
            transcript,
        }
    }
}

/// Transcript summarization by a language model.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, transcript: &Transcript) -> MlResult<SummaryResult>;

    /// Cheap reachability check.
    async fn health_check(&self) -> MlResult<()> {
        Ok(())
    }
}
