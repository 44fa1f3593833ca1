//! In-memory notification log for tests and single-process runs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use vsum_models::{Notification, NotificationId, VideoId};

use crate::error::{NotificationError, NotifyResult};
use crate::log::{Appended, NotificationLog, DEFAULT_TTL};

#[derive(Debug, Default)]
struct State {
    by_id: HashMap<NotificationId, Notification>,
    by_key: HashMap<String, NotificationId>,
}

#[derive(Debug, Clone)]
pub struct MemoryNotificationLog {
    state: Arc<Mutex<State>>,
    ttl: Duration,
}

impl Default for MemoryNotificationLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNotificationLog {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_expired(&self, n: &Notification, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => n.created_at + ttl <= now,
            Err(_) => false,
        }
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut state = self.lock();
        let expired: Vec<NotificationId> = state
            .by_id
            .values()
            .filter(|n| self.is_expired(n, now))
            .map(|n| n.id.clone())
            .collect();

        for id in &expired {
            if let Some(n) = state.by_id.remove(id) {
                state.by_key.remove(&n.key);
            }
        }
        expired.len()
    }

    /// Every entry for an owner, read or not.
    pub fn all_for(&self, owner_id: &str) -> Vec<Notification> {
        self.lock()
            .by_id
            .values()
            .filter(|n| n.owner_id == owner_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl NotificationLog for MemoryNotificationLog {
    async fn append(
        &self,
        owner_id: &str,
        key: &str,
        message: &str,
        video_id: Option<VideoId>,
    ) -> NotifyResult<Appended> {
        let now = Utc::now();
        let mut state = self.lock();

        let existing = state
            .by_key
            .get(key)
            .and_then(|id| state.by_id.get(id))
            .filter(|n| !self.is_expired(n, now))
            .cloned();
        if let Some(notification) = existing {
            return Ok(Appended {
                notification,
                created: false,
            });
        }

        let notification = Notification::new(owner_id, key, message, video_id);
        state.by_key.insert(key.to_string(), notification.id.clone());
        state
            .by_id
            .insert(notification.id.clone(), notification.clone());
        Ok(Appended {
            notification,
            created: true,
        })
    }

    async fn list_unread(&self, owner_id: &str) -> NotifyResult<Vec<Notification>> {
        let now = Utc::now();
        let mut unread: Vec<Notification> = self
            .lock()
            .by_id
            .values()
            .filter(|n| n.owner_id == owner_id && !n.read && !self.is_expired(n, now))
            .cloned()
            .collect();
        unread.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(unread)
    }

    async fn mark_read(&self, id: &NotificationId) -> NotifyResult<bool> {
        let mut state = self.lock();
        let notification = state
            .by_id
            .get_mut(id)
            .ok_or_else(|| NotificationError::not_found(id.as_str()))?;
        if notification.read {
            return Ok(false);
        }
        notification.read = true;
        Ok(true)
    }

    async fn get(&self, id: &NotificationId) -> NotifyResult<Option<Notification>> {
        Ok(self.lock().by_id.get(id).cloned())
    }
}
