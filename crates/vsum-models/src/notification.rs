//! Notification records kept in the per-user notification log.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::VideoId;

/// Unique identifier for a notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct NotificationId(pub String);

impl NotificationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NotificationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Idempotency key for the completion notification of a video.
pub fn summary_notification_key(owner_id: &str, video_id: &VideoId) -> String {
    format!("{}:{}", owner_id, video_id)
}

/// A completion event for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Notification {
    pub id: NotificationId,
    pub owner_id: String,
    /// Idempotency / grouping key
    pub key: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_id: Option<VideoId>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

impl Notification {
    pub fn new(
        owner_id: impl Into<String>,
        key: impl Into<String>,
        message: impl Into<String>,
        video_id: Option<VideoId>,
    ) -> Self {
        Self {
            id: NotificationId::new(),
            owner_id: owner_id.into(),
            key: key.into(),
            message: message.into(),
            video_id,
            created_at: Utc::now(),
            read: false,
        }
    }
}
