//! Video repository trait.

use async_trait::async_trait;
use vsum_models::{NewVideo, SummaryBlob, VideoId, VideoMetadata};

use crate::error::DbResult;

/// Insert outcome: the row, and whether this call created it.
#[derive(Debug, Clone)]
pub struct Inserted {
    pub video: VideoMetadata,
    pub created: bool,
}

/// Persistence for video rows.
#[async_trait]
pub trait VideoRepository: Send + Sync {
    /// Insert a row keyed by `upload_key`. If a row with that key already
    /// exists it is returned unchanged.
    async fn insert_idempotent(&self, video: NewVideo) -> DbResult<Inserted>;

    async fn get(&self, id: &VideoId) -> DbResult<Option<VideoMetadata>>;

    /// Set `is_summarized` and store the summary. Unknown ids are `NotFound`.
    async fn mark_summarized(&self, id: &VideoId, summary: &SummaryBlob)
        -> DbResult<VideoMetadata>;
}
