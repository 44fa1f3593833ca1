//! Video metadata models.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for an uploaded video (primary key of the video row).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct VideoId(pub Uuid);

impl VideoId {
    /// Generate a new random video ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for VideoId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for VideoId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for VideoId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// A single time-coded transcript segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TranscriptChunk {
    /// Offset from the start of the media, in seconds
    pub time: f64,
    pub text: String,
}

/// Transcript returned by the transcription service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Transcript {
    pub text: String,
    #[serde(default)]
    pub chunks: Vec<TranscriptChunk>,
}

impl Transcript {
    /// True when there is no usable text.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty() && self.chunks.iter().all(|c| c.text.trim().is_empty())
    }

    /// Render the transcript as `[MM:SS] text` lines for prompting.
    ///
    /// Falls back to the flat text when no chunks are available.
    pub fn to_timestamped_text(&self) -> String {
        if self.chunks.is_empty() {
            return self.text.clone();
        }
        self.chunks
            .iter()
            .map(|c| {
                let secs = c.time.max(0.0) as u64;
                format!("[{:02}:{:02}] {}", secs / 60, secs % 60, c.text.trim())
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A summary point with the transcript timestamps that support it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct KeyPoint {
    pub text: String,
    /// Supporting citations, in seconds from the start of the media
    #[serde(default)]
    pub timestamps: Vec<f64>,
}

/// Result of the summarize stage, stored on the video row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SummaryBlob {
    pub summary: String,
    #[serde(default)]
    pub key_points: Vec<KeyPoint>,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub transcript: Transcript,
}

/// Video row in the media store.
///
/// Created by the upload stage. `is_summarized` and `summary_blob` are only
/// ever written by the summarize stage, after the upload job has finished.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VideoMetadata {
    pub id: VideoId,

    /// Owning user
    pub owner_id: String,

    pub title: String,

    pub description: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,

    /// Durable object store URL of the raw media
    pub media_url: String,

    /// Object store key of the raw media
    pub media_key: String,

    pub mime_type: String,

    /// Original client-side file name
    pub file_name: String,

    /// Job-derived idempotency key for the insert
    pub upload_key: String,

    #[serde(default)]
    pub is_summarized: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_blob: Option<SummaryBlob>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// Fields supplied by the upload stage when creating a video row.
#[derive(Debug, Clone)]
pub struct NewVideo {
    pub owner_id: String,
    pub title: String,
    pub description: String,
    pub thumbnail_url: Option<String>,
    pub media_url: String,
    pub media_key: String,
    pub mime_type: String,
    pub file_name: String,
    pub upload_key: String,
}

impl NewVideo {
    /// Materialize a fresh row with a new id.
    pub fn into_metadata(self) -> VideoMetadata {
        let now = Utc::now();
        VideoMetadata {
            id: VideoId::new(),
            owner_id: self.owner_id,
            title: self.title,
            description: self.description,
            thumbnail_url: self.thumbnail_url,
            media_url: self.media_url,
            media_key: self.media_key,
            mime_type: self.mime_type,
            file_name: self.file_name,
            upload_key: self.upload_key,
            is_summarized: false,
            summary_blob: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamped_text_formats_minutes() {
        let t = Transcript {
            text: "hello world".into(),
            chunks: vec![
                TranscriptChunk { time: 5.2, text: "hello".into() },
                TranscriptChunk { time: 75.0, text: " world ".into() },
            ],
        };
        assert_eq!(t.to_timestamped_text(), "[00:05] hello\n[01:15] world");
    }

    #[test]
    fn blank_transcript() {
        assert!(Transcript::default().is_blank());
        let t = Transcript {
            text: "  ".into(),
            chunks: vec![TranscriptChunk { time: 0.0, text: "".into() }],
        };
        assert!(t.is_blank());
    }

    #[test]
    fn video_id_parses() {
        let id = VideoId::new();
        let parsed: VideoId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
