//! In-memory video repository for tests and local runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use vsum_models::{NewVideo, SummaryBlob, VideoId, VideoMetadata};

use crate::error::{DbError, DbResult};
use crate::repo::{Inserted, VideoRepository};

#[derive(Default)]
struct State {
    videos: HashMap<VideoId, VideoMetadata>,
    by_upload_key: HashMap<String, VideoId>,
}

#[derive(Clone, Default)]
pub struct MemoryVideoRepository {
    state: Arc<Mutex<State>>,
}

impl MemoryVideoRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.lock().videos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All rows, oldest first.
    pub fn all(&self) -> Vec<VideoMetadata> {
        let mut videos: Vec<_> = self.lock().videos.values().cloned().collect();
        videos.sort_by_key(|v| v.created_at);
        videos
    }
}

#[async_trait]
impl VideoRepository for MemoryVideoRepository {
    async fn insert_idempotent(&self, video: NewVideo) -> DbResult<Inserted> {
        let mut state = self.lock();
        if let Some(existing) = state
            .by_upload_key
            .get(&video.upload_key)
            .and_then(|id| state.videos.get(id))
        {
            return Ok(Inserted {
                video: existing.clone(),
                created: false,
            });
        }

        let row = video.into_metadata();
        state.by_upload_key.insert(row.upload_key.clone(), row.id);
        state.videos.insert(row.id, row.clone());
        Ok(Inserted {
            video: row,
            created: true,
        })
    }

    async fn get(&self, id: &VideoId) -> DbResult<Option<VideoMetadata>> {
        Ok(self.lock().videos.get(id).cloned())
    }

    async fn mark_summarized(
        &self,
        id: &VideoId,
        summary: &SummaryBlob,
    ) -> DbResult<VideoMetadata> {
        let mut state = self.lock();
        let video = state
            .videos
            .get_mut(id)
            .ok_or_else(|| DbError::not_found(id.to_string()))?;
        video.is_summarized = true;
        video.summary_blob = Some(summary.clone());
        video.updated_at = Utc::now();
        Ok(video.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vsum_models::Transcript;

    fn new_video(upload_key: &str) -> NewVideo {
        NewVideo {
            owner_id: "user_1".into(),
            title: "Talk".into(),
            description: String::new(),
            thumbnail_url: None,
            media_url: "memory://objects/videos/talk.mp4".into(),
            media_key: "talk.mp4".into(),
            mime_type: "video/mp4".into(),
            file_name: "talk.mp4".into(),
            upload_key: upload_key.into(),
        }
    }

    #[tokio::test]
    async fn second_insert_returns_existing_row() {
        let repo = MemoryVideoRepository::new();
        let first = repo.insert_idempotent(new_video("upload:1")).await.unwrap();
        let second = repo.insert_idempotent(new_video("upload:1")).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.video.id, second.video.id);
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn mark_summarized_updates_row() {
        let repo = MemoryVideoRepository::new();
        let id = repo.insert_idempotent(new_video("upload:2")).await.unwrap().video.id;
        let blob = SummaryBlob {
            summary: "A talk about Rust".into(),
            key_points: vec![],
            keywords: vec!["rust".into()],
            transcript: Transcript::default(),
        };

        let updated = repo.mark_summarized(&id, &blob).await.unwrap();
        assert!(updated.is_summarized);
        assert_eq!(repo.get(&id).await.unwrap().unwrap().summary_blob, Some(blob));
    }

    #[tokio::test]
    async fn mark_summarized_unknown_is_not_found() {
        let repo = MemoryVideoRepository::new();
        let blob = SummaryBlob {
            summary: "x".into(),
            key_points: vec![],
            keywords: vec![],
            transcript: Transcript::default(),
        };
        let err = repo.mark_summarized(&VideoId::new(), &blob).await.unwrap_err();
        assert!(matches!(err, DbError::NotFound(_)));
        assert!(!err.is_retryable());
    }
}
