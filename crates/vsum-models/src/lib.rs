//! Shared data models for the vidsum pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Job identifiers, stages and queue states
//! - Video rows and summarization results
//! - Notifications and realtime push messages

pub mod job;
pub mod notification;
pub mod video;
pub mod ws;

// Re-export common types
pub use job::{JobId, JobStatus, Stage};
pub use notification::{summary_notification_key, Notification, NotificationId};
pub use video::{KeyPoint, NewVideo, SummaryBlob, Transcript, TranscriptChunk, VideoId, VideoMetadata};
pub use ws::{ClientMessage, PushEvent};
