//! Realtime push message types.
//!
//! Server → client events carried by the push channel and the client → server
//! acknowledgement. The JSON shape is shared by every transport.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{Notification, NotificationId};

/// Server → client event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushEvent {
    /// A new notification was appended to the log
    Notification { notification: Notification },

    /// Unread backlog sent right after (re)connect
    Backfill { notifications: Vec<Notification> },
}

impl PushEvent {
    pub fn notification(notification: Notification) -> Self {
        Self::Notification { notification }
    }

    pub fn backfill(notifications: Vec<Notification>) -> Self {
        Self::Backfill { notifications }
    }

    /// Event name on the wire.
    pub fn event_name(&self) -> &'static str {
        match self {
            PushEvent::Notification { .. } => "notification",
            PushEvent::Backfill { .. } => "backfill",
        }
    }
}

/// Client → server message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// The client displayed a notification
    NotificationRead {
        #[serde(rename = "notificationId")]
        notification_id: NotificationId,
    },
}
