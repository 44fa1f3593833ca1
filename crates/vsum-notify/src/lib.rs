//! Completion notifications.
//!
//! - [`NotificationLog`]: durable, idempotent per-user log (Redis or memory)
//! - [`ConnectionRegistry`] and [`PushPublisher`]: best-effort live delivery
//! - [`ClientSession`]: connect, backfill, acknowledge

pub mod error;
pub mod log;
pub mod memory;
pub mod metrics;
pub mod push;
pub mod redis_log;
pub mod session;

pub use error::{NotificationError, NotifyResult};
pub use log::{Appended, NotificationConfig, NotificationLog, DEFAULT_TTL};
pub use memory::MemoryNotificationLog;
pub use push::{
    ConnectionRegistry, PushPublisher, RedisPushPublisher, RedisPushRelay, Session, SessionId,
};
pub use redis_log::RedisNotificationLog;
pub use session::ClientSession;
