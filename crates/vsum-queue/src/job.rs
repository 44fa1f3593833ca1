//! Job payloads for the queue.

use std::fmt;

use serde::{Deserialize, Serialize};
use vsum_models::{Stage, VideoId};

/// Raw upload bytes travel through the queue as base64, like any other JSON field.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(d)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Job to persist a raw upload and create its video row.
#[derive(Clone, Serialize, Deserialize)]
pub struct UploadJobPayload {
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    pub mime_type: String,
    pub file_name: String,
    #[serde(with = "base64_bytes")]
    pub raw_bytes: Vec<u8>,
    pub owner_id: String,
}

impl UploadJobPayload {
    pub fn new(
        owner_id: impl Into<String>,
        title: impl Into<String>,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        raw_bytes: Vec<u8>,
    ) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            thumbnail_url: None,
            mime_type: mime_type.into(),
            file_name: file_name.into(),
            raw_bytes,
            owner_id: owner_id.into(),
        }
    }

    /// Set description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set thumbnail URL.
    pub fn with_thumbnail(mut self, url: impl Into<String>) -> Self {
        self.thumbnail_url = Some(url.into());
        self
    }
}

// Raw bytes can be hundreds of megabytes; never dump them into logs.
impl fmt::Debug for UploadJobPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadJobPayload")
            .field("title", &self.title)
            .field("mime_type", &self.mime_type)
            .field("file_name", &self.file_name)
            .field("raw_bytes", &format_args!("<{} bytes>", self.raw_bytes.len()))
            .field("owner_id", &self.owner_id)
            .finish()
    }
}

/// What the summarize stage needs to know about the upload without reloading it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationContext {
    pub video_title: String,
    /// Bucket holding the raw media
    pub bucket: String,
    /// Object key of the raw media
    pub media_key: String,
    pub file_name: String,
    pub mime_type: String,
}

/// Job to transcribe and summarize an uploaded video, then notify its owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummarizeJobPayload {
    pub video_id: VideoId,
    pub owner_id: String,
    pub notification_context: NotificationContext,
}

impl SummarizeJobPayload {
    /// Dedup key: at most one live summarize job per (owner, video).
    pub fn dedup_key(&self) -> String {
        format!("summarize:{}:{}", self.owner_id, self.video_id)
    }
}

/// Generic job wrapper for queue storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueJob {
    /// Persist raw media, write the video row, chain a summarize job
    Upload(UploadJobPayload),
    /// Transcribe, summarize, update the row and notify the owner
    Summarize(SummarizeJobPayload),
}

impl QueueJob {
    pub fn stage(&self) -> Stage {
        match self {
            QueueJob::Upload(_) => Stage::Upload,
            QueueJob::Summarize(_) => Stage::Summarize,
        }
    }

    pub fn dedup_key(&self) -> Option<String> {
        match self {
            QueueJob::Upload(_) => None,
            QueueJob::Summarize(j) => Some(j.dedup_key()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_payload_encodes_bytes_as_base64() {
        let job = QueueJob::Upload(UploadJobPayload::new(
            "user_1",
            "Lecture",
            "lecture.mp4",
            "video/mp4",
            vec![0, 1, 2, 255],
        ));

        let json = serde_json::to_value(&job).expect("serialize QueueJob");
        assert_eq!(json["type"], "upload");
        assert_eq!(json["raw_bytes"], "AAEC/w==");

        let decoded: QueueJob = serde_json::from_value(json).expect("deserialize QueueJob");
        match decoded {
            QueueJob::Upload(p) => assert_eq!(p.raw_bytes, vec![0, 1, 2, 255]),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn debug_hides_raw_bytes() {
        let p = UploadJobPayload::new("u", "t", "f.mp4", "video/mp4", vec![7; 1024]);
        let dbg = format!("{p:?}");
        assert!(dbg.contains("<1024 bytes>"));
        assert!(!dbg.contains("7, 7"));
    }

    #[test]
    fn summarize_dedup_key_is_per_owner_and_video() {
        let video_id = VideoId::new();
        let job = QueueJob::Summarize(SummarizeJobPayload {
            video_id,
            owner_id: "user_9".into(),
            notification_context: NotificationContext {
                video_title: "t".into(),
                bucket: "videos".into(),
                media_key: "k".into(),
                file_name: "f.mp4".into(),
                mime_type: "video/mp4".into(),
            },
        });
        assert_eq!(job.stage(), Stage::Summarize);
        assert_eq!(job.dedup_key(), Some(format!("summarize:user_9:{}", video_id)));
    }
}
