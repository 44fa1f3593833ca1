//! Realtime push channel.
//!
//! [`ConnectionRegistry`] tracks the live sessions of each owner. A session
//! is registered by [`ConnectionRegistry::join`] when a client connects and
//! removed by [`ConnectionRegistry::leave`] or by dropping its [`Session`].
//! Delivery is best effort: the notification log is the durable record.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use vsum_models::PushEvent;

use crate::error::NotifyResult;
use crate::metrics;

/// Per-session send buffer.
const SESSION_BUFFER_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Default)]
struct Rooms {
    by_owner: HashMap<String, HashMap<SessionId, mpsc::Sender<PushEvent>>>,
    owners: HashMap<SessionId, String>,
}

impl Rooms {
    fn remove(&mut self, id: SessionId) -> bool {
        let Some(owner) = self.owners.remove(&id) else {
            return false;
        };
        if let Some(room) = self.by_owner.get_mut(&owner) {
            room.remove(&id);
            if room.is_empty() {
                self.by_owner.remove(&owner);
            }
        }
        true
    }
}

struct RegistryInner {
    rooms: Mutex<Rooms>,
    next_id: AtomicU64,
    buffer: usize,
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, Rooms> {
        self.rooms.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn leave(&self, id: SessionId) -> bool {
        let mut rooms = self.lock();
        let removed = rooms.remove(id);
        if removed {
            metrics::set_active_sessions(rooms.owners.len());
        }
        removed
    }
}

/// Live client sessions grouped by owner.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_buffer(SESSION_BUFFER_SIZE)
    }

    /// Set the per-session buffer; events beyond it are dropped.
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                rooms: Mutex::new(Rooms::default()),
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
            }),
        }
    }

    /// Register a new session in the owner's room.
    pub fn join(&self, owner_id: &str) -> Session {
        let id = SessionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(self.inner.buffer);

        let mut rooms = self.inner.lock();
        rooms
            .by_owner
            .entry(owner_id.to_string())
            .or_default()
            .insert(id, tx);
        rooms.owners.insert(id, owner_id.to_string());
        metrics::set_active_sessions(rooms.owners.len());
        drop(rooms);

        debug!(owner_id, session = %id, "Session joined");
        Session {
            id,
            owner_id: owner_id.to_string(),
            rx,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a session. Returns false if it was not registered.
    pub fn leave(&self, id: SessionId) -> bool {
        let removed = self.inner.leave(id);
        if removed {
            debug!(session = %id, "Session left");
        }
        removed
    }

    /// Deliver an event to every live session of an owner.
    ///
    /// Returns how many sessions accepted it. Full buffers drop the event;
    /// closed sessions are removed.
    pub fn emit(&self, owner_id: &str, event: &PushEvent) -> usize {
        let mut rooms = self.inner.lock();
        let Some(room) = rooms.by_owner.get(owner_id) else {
            return 0;
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, tx) in room {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(owner_id, session = %id, "Session buffer full; dropping event");
                    metrics::record_dropped("full");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    metrics::record_dropped("closed");
                    closed.push(*id);
                }
            }
        }
        for id in closed {
            rooms.remove(id);
        }
        metrics::set_active_sessions(rooms.owners.len());

        if delivered > 0 {
            metrics::record_delivered(event.event_name(), delivered);
        }
        delivered
    }

    pub fn session_count(&self, owner_id: &str) -> usize {
        self.inner
            .lock()
            .by_owner
            .get(owner_id)
            .map_or(0, HashMap::len)
    }
}

/// One connected client. Dropping it leaves the room.
pub struct Session {
    id: SessionId,
    owner_id: String,
    rx: mpsc::Receiver<PushEvent>,
    registry: Weak<RegistryInner>,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Wait for the next pushed event. `None` once the session was removed.
    pub async fn recv(&mut self) -> Option<PushEvent> {
        self.rx.recv().await
    }

    /// Take an already-buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<PushEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.leave(self.id);
        }
    }
}

/// Where the worker sends live events.
#[async_trait]
pub trait PushPublisher: Send + Sync {
    /// Publish to the owner's sessions. Returns the number of receivers
    /// reached, as far as the transport knows.
    async fn publish(&self, owner_id: &str, event: &PushEvent) -> NotifyResult<usize>;
}

#[async_trait]
impl PushPublisher for ConnectionRegistry {
    async fn publish(&self, owner_id: &str, event: &PushEvent) -> NotifyResult<usize> {
        Ok(self.emit(owner_id, event))
    }
}

fn channel_prefix(prefix: &str) -> String {
    format!("{}:push:", prefix)
}

/// Publishes events on `{prefix}:push:{owner}` for relays in other processes.
pub struct RedisPushPublisher {
    client: redis::Client,
    prefix: String,
}

impl RedisPushPublisher {
    pub fn new(redis_url: &str, prefix: impl Into<String>) -> NotifyResult<Self> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            prefix: prefix.into(),
        })
    }

    pub fn channel_name(&self, owner_id: &str) -> String {
        format!("{}{}", channel_prefix(&self.prefix), owner_id)
    }
}

#[async_trait]
impl PushPublisher for RedisPushPublisher {
    async fn publish(&self, owner_id: &str, event: &PushEvent) -> NotifyResult<usize> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let channel = self.channel_name(owner_id);
        let payload = serde_json::to_string(event)?;

        debug!(channel = %channel, event = event.event_name(), "Publishing push event");
        let receivers: usize = conn.publish(channel, payload).await?;
        Ok(receivers)
    }
}

/// Forwards events from Redis pub/sub into a local registry.
pub struct RedisPushRelay {
    client: redis::Client,
    prefix: String,
    registry: ConnectionRegistry,
}

impl RedisPushRelay {
    pub fn new(
        redis_url: &str,
        prefix: impl Into<String>,
        registry: ConnectionRegistry,
    ) -> NotifyResult<Self> {
        Ok(Self {
            client: redis::Client::open(redis_url)?,
            prefix: prefix.into(),
            registry,
        })
    }

    /// Relay until `shutdown` flips to true or the subscription ends.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> NotifyResult<()> {
        let channel_prefix = channel_prefix(&self.prefix);
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(format!("{}*", channel_prefix)).await?;
        info!(pattern = %format!("{}*", channel_prefix), "Push relay subscribed");

        let mut messages = pubsub.into_on_message();
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Push relay shutting down");
                        return Ok(());
                    }
                }
                msg = messages.next() => {
                    let Some(msg) = msg else {
                        warn!("Push relay subscription closed");
                        return Ok(());
                    };
                    let channel = msg.get_channel_name().to_string();
                    let Some(owner_id) = channel.strip_prefix(&channel_prefix) else {
                        continue;
                    };
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            warn!(channel = %channel, error = %e, "Unreadable push payload");
                            continue;
                        }
                    };
                    match serde_json::from_str::<PushEvent>(&payload) {
                        Ok(event) => {
                            self.registry.emit(owner_id, &event);
                        }
                        Err(e) => warn!(channel = %channel, error = %e, "Invalid push event"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vsum_models::Notification;

    fn event(owner: &str) -> PushEvent {
        PushEvent::notification(Notification::new(owner, "k", "done", None))
    }

    #[tokio::test]
    async fn emit_reaches_every_session_of_the_owner() {
        let registry = ConnectionRegistry::new();
        let mut a = registry.join("u1");
        let mut b = registry.join("u1");
        let mut other = registry.join("u2");

        assert_eq!(registry.emit("u1", &event("u1")), 2);
        assert!(a.recv().await.is_some());
        assert!(b.recv().await.is_some());
        assert!(other.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropping_a_session_leaves_the_room() {
        let registry = ConnectionRegistry::new();
        let session = registry.join("u1");
        assert_eq!(registry.session_count("u1"), 1);

        drop(session);
        assert_eq!(registry.session_count("u1"), 0);
        assert_eq!(registry.emit("u1", &event("u1")), 0);
    }

    #[tokio::test]
    async fn explicit_leave_closes_the_session() {
        let registry = ConnectionRegistry::new();
        let mut session = registry.join("u1");

        assert!(registry.leave(session.id()));
        assert!(!registry.leave(session.id()));
        assert!(session.recv().await.is_none());
    }

    #[tokio::test]
    async fn full_buffer_drops_instead_of_blocking() {
        let registry = ConnectionRegistry::with_buffer(1);
        let _session = registry.join("u1");

        assert_eq!(registry.emit("u1", &event("u1")), 1);
        assert_eq!(registry.emit("u1", &event("u1")), 0);
    }

    #[tokio::test]
    async fn registry_publishes_in_process() {
        let registry = ConnectionRegistry::new();
        let mut session = registry.join("u1");
        let publisher: &dyn PushPublisher = &registry;

        assert_eq!(publisher.publish("u1", &event("u1")).await.unwrap(), 1);
        assert!(matches!(
            session.recv().await,
            Some(PushEvent::Notification { .. })
        ));
    }

    #[test]
    fn channel_names_are_per_owner() {
        let publisher = RedisPushPublisher::new("redis://localhost:6379", "vsum").unwrap();
        assert_eq!(publisher.channel_name("u1"), "vsum:push:u1");
    }

    // Run with a local Redis: REDIS_URL=... cargo test -p vsum-notify -- --ignored
    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn relay_forwards_published_events() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        let registry = ConnectionRegistry::new();
        let mut session = registry.join("u1");
        let (tx, rx) = watch::channel(false);

        let relay = RedisPushRelay::new(&url, "vsum-relay-test", registry.clone()).unwrap();
        let handle = tokio::spawn(relay.run(rx));
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        let publisher = RedisPushPublisher::new(&url, "vsum-relay-test").unwrap();
        publisher.publish("u1", &event("u1")).await.unwrap();

        let received = tokio::time::timeout(std::time::Duration::from_secs(5), session.recv())
            .await
            .unwrap();
        assert!(received.is_some());

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
