//! Client side of the push protocol.
//!
//! On connect the client joins its room and first receives the unread
//! backlog from the log, then live events. Acknowledging an event marks the
//! notification read in the log.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;
use vsum_models::{ClientMessage, NotificationId, PushEvent};

use crate::error::NotifyResult;
use crate::log::NotificationLog;
use crate::push::{ConnectionRegistry, Session};

pub struct ClientSession {
    session: Session,
    log: Arc<dyn NotificationLog>,
    pending: VecDeque<PushEvent>,
}

impl ClientSession {
    /// Join before reading the backlog, so nothing appended in between is
    /// missed. An event may then arrive both ways; clients dedupe by id.
    pub async fn connect(
        registry: &ConnectionRegistry,
        log: Arc<dyn NotificationLog>,
        owner_id: &str,
    ) -> NotifyResult<Self> {
        let session = registry.join(owner_id);
        let unread = log.list_unread(owner_id).await?;
        debug!(owner_id, unread = unread.len(), "Client connected");

        Ok(Self {
            session,
            log,
            pending: VecDeque::from([PushEvent::backfill(unread)]),
        })
    }

    pub fn owner_id(&self) -> &str {
        self.session.owner_id()
    }

    /// The backfill first, then live events. `None` once disconnected.
    pub async fn next_event(&mut self) -> Option<PushEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Some(event);
        }
        self.session.recv().await
    }

    /// Mark a notification read. Returns false if it already was.
    pub async fn acknowledge(&self, id: &NotificationId) -> NotifyResult<bool> {
        self.log.mark_read(id).await
    }

    /// Apply a message sent by the client.
    pub async fn handle(&self, message: ClientMessage) -> NotifyResult<bool> {
        match message {
            ClientMessage::NotificationRead { notification_id } => {
                self.acknowledge(&notification_id).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryNotificationLog;
    use crate::push::PushPublisher;

    #[tokio::test]
    async fn connect_backfills_then_streams_live_events() {
        let registry = ConnectionRegistry::new();
        let log = Arc::new(MemoryNotificationLog::new());
        let missed = log.append("u1", "u1:v1", "first", None).await.unwrap();

        let mut client = ClientSession::connect(&registry, log.clone(), "u1").await.unwrap();
        match client.next_event().await {
            Some(PushEvent::Backfill { notifications }) => {
                assert_eq!(notifications, vec![missed.notification]);
            }
            other => panic!("expected backfill, got {other:?}"),
        }

        let live = log.append("u1", "u1:v2", "second", None).await.unwrap();
        registry
            .publish("u1", &PushEvent::notification(live.notification.clone()))
            .await
            .unwrap();
        assert_eq!(
            client.next_event().await,
            Some(PushEvent::notification(live.notification))
        );
    }

    #[tokio::test]
    async fn acknowledging_twice_keeps_read_and_is_not_an_error() {
        let registry = ConnectionRegistry::new();
        let log = Arc::new(MemoryNotificationLog::new());
        let n = log.append("u1", "u1:v1", "done", None).await.unwrap().notification;
        let client = ClientSession::connect(&registry, log.clone(), "u1").await.unwrap();

        let ack = ClientMessage::NotificationRead {
            notification_id: n.id.clone(),
        };
        assert!(client.handle(ack.clone()).await.unwrap());
        assert!(!client.handle(ack).await.unwrap());
        assert!(log.get(&n.id).await.unwrap().unwrap().read);
    }

    #[tokio::test]
    async fn reconnect_backfill_excludes_read_entries() {
        let registry = ConnectionRegistry::new();
        let log = Arc::new(MemoryNotificationLog::new());
        let a = log.append("u1", "a", "one", None).await.unwrap().notification;
        log.append("u1", "b", "two", None).await.unwrap();

        let client = ClientSession::connect(&registry, log.clone(), "u1").await.unwrap();
        client.acknowledge(&a.id).await.unwrap();
        drop(client);
        assert_eq!(registry.session_count("u1"), 0);

        let mut again = ClientSession::connect(&registry, log.clone(), "u1").await.unwrap();
        match again.next_event().await {
            Some(PushEvent::Backfill { notifications }) => {
                assert_eq!(notifications.len(), 1);
                assert_eq!(notifications[0].key, "b");
            }
            other => panic!("expected backfill, got {other:?}"),
        }
    }
}
