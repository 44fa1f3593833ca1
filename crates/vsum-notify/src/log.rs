//! Durable per-user notification log.
//!
//! The log is the source of truth for completion events; push delivery is
//! only an optimization on top of it. Appends are idempotent by key so a
//! replayed summarize job never notifies twice.

use std::time::Duration;

use async_trait::async_trait;
use vsum_models::{Notification, NotificationId, VideoId};

use crate::error::NotifyResult;

/// Default retention for notifications.
pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Result of [`NotificationLog::append`].
#[derive(Debug, Clone, PartialEq)]
pub struct Appended {
    pub notification: Notification,
    /// False when an entry with the same key already existed
    pub created: bool,
}

/// Configuration shared by the log backends.
#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub redis_url: String,
    pub key_prefix: String,
    pub ttl: Duration,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "vsum".to_string(),
            ttl: DEFAULT_TTL,
        }
    }
}

impl NotificationConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            key_prefix: std::env::var("QUEUE_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            ttl: std::env::var("NOTIFICATION_TTL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.ttl),
        }
    }
}

#[async_trait]
pub trait NotificationLog: Send + Sync {
    /// Append a notification unless one with `key` already exists, in which
    /// case the existing entry is returned with `created = false`.
    async fn append(
        &self,
        owner_id: &str,
        key: &str,
        message: &str,
        video_id: Option<VideoId>,
    ) -> NotifyResult<Appended>;

    /// Unread, unexpired notifications for an owner, newest first.
    async fn list_unread(&self, owner_id: &str) -> NotifyResult<Vec<Notification>>;

    /// Flip `read` to true. Returns false when it was already read.
    async fn mark_read(&self, id: &NotificationId) -> NotifyResult<bool>;

    async fn get(&self, id: &NotificationId) -> NotifyResult<Option<Notification>>;
}
