//! Redis-backed notification log.
//!
//! Layout, with `{p}` the key prefix:
//!
//! - `{p}:notif:{id}`: hash with `data` (JSON record) and `read` (`0`/`1`)
//! - `{p}:notif:key:{key}`: id of the entry holding an idempotency key
//! - `{p}:notif:owner:{owner}`: zset of ids scored by `created_at` (ms)
//!
//! Every key carries the retention TTL. `read` lives in its own hash field so
//! marking an entry read never rewrites the record.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::{AsyncCommands, Script};
use tracing::{debug, info};
use vsum_models::{Notification, NotificationId, VideoId};

use crate::error::{NotificationError, NotifyResult};
use crate::log::{Appended, NotificationConfig, NotificationLog};

// KEYS: key guard, owner index. ARGV: prefix, now_ms, id, json, ttl_secs.
const APPEND: &str = r#"
local function record_key(id) return ARGV[1] .. ':notif:' .. id end
local existing = redis.call('GET', KEYS[1])
if existing then
  local rk = record_key(existing)
  local data = redis.call('HGET', rk, 'data')
  if data then return {0, data, redis.call('HGET', rk, 'read') or '0'} end
end
local rk = record_key(ARGV[3])
redis.call('SET', KEYS[1], ARGV[3], 'EX', ARGV[5])
redis.call('HSET', rk, 'data', ARGV[4], 'read', '0')
redis.call('EXPIRE', rk, ARGV[5])
redis.call('ZADD', KEYS[2], ARGV[2], ARGV[3])
redis.call('EXPIRE', KEYS[2], ARGV[5])
return {1, ARGV[4], '0'}
"#;

// KEYS: record. Returns -1 unknown, 0 already read, 1 flipped.
const MARK_READ: &str = r#"
local read = redis.call('HGET', KEYS[1], 'read')
if not read then return -1 end
if read == '1' then return 0 end
redis.call('HSET', KEYS[1], 'read', '1')
return 1
"#;

pub struct RedisNotificationLog {
    client: redis::Client,
    prefix: String,
    ttl: Duration,
    append: Script,
    mark_read: Script,
}

impl RedisNotificationLog {
    pub fn new(config: &NotificationConfig) -> NotifyResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            prefix: config.key_prefix.clone(),
            ttl: config.ttl,
            append: Script::new(APPEND),
            mark_read: Script::new(MARK_READ),
        })
    }

    /// Create from environment variables.
    pub fn from_env() -> NotifyResult<Self> {
        Self::new(&NotificationConfig::from_env())
    }

    /// Check that Redis answers.
    pub async fn ping(&self) -> NotifyResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!(prefix = %self.prefix, "Connected to Redis notification log");
        Ok(())
    }

    fn record_key(&self, id: &str) -> String {
        format!("{}:notif:{}", self.prefix, id)
    }

    fn guard_key(&self, key: &str) -> String {
        format!("{}:notif:key:{}", self.prefix, key)
    }

    fn owner_key(&self, owner_id: &str) -> String {
        format!("{}:notif:owner:{}", self.prefix, owner_id)
    }

    fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs().max(1)
    }
}

fn decode(id: &str, data: &str, read: &str) -> NotifyResult<Notification> {
    let mut notification: Notification = serde_json::from_str(data)
        .map_err(|e| NotificationError::corrupt(id, e.to_string()))?;
    notification.read = read == "1";
    Ok(notification)
}

#[async_trait]
impl NotificationLog for RedisNotificationLog {
    async fn append(
        &self,
        owner_id: &str,
        key: &str,
        message: &str,
        video_id: Option<VideoId>,
    ) -> NotifyResult<Appended> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let candidate = Notification::new(owner_id, key, message, video_id);
        let json = serde_json::to_string(&candidate)?;

        let (created, data, read): (i64, String, String) = self
            .append
            .key(self.guard_key(key))
            .key(self.owner_key(owner_id))
            .arg(&self.prefix)
            .arg(candidate.created_at.timestamp_millis())
            .arg(candidate.id.as_str())
            .arg(json)
            .arg(self.ttl_secs())
            .invoke_async(&mut conn)
            .await?;

        let created = created == 1;
        if !created {
            debug!(owner_id, key, "Notification key already present");
        }
        Ok(Appended {
            notification: decode(key, &data, &read)?,
            created,
        })
    }

    async fn list_unread(&self, owner_id: &str) -> NotifyResult<Vec<Notification>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let owner_key = self.owner_key(owner_id);
        let cutoff = Utc::now().timestamp_millis() - self.ttl.as_millis() as i64;

        let _: i64 = conn.zrembyscore(&owner_key, "-inf", cutoff).await?;
        let ids: Vec<String> = conn.zrevrange(&owner_key, 0, -1).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.cmd("HMGET").arg(self.record_key(id)).arg("data").arg("read");
        }
        let rows: Vec<(Option<String>, Option<String>)> = pipe.query_async(&mut conn).await?;

        let mut unread = Vec::new();
        for (id, row) in ids.iter().zip(rows) {
            if let (Some(data), Some(read)) = row {
                if read != "1" {
                    unread.push(decode(id, &data, &read)?);
                }
            }
        }
        Ok(unread)
    }

    async fn mark_read(&self, id: &NotificationId) -> NotifyResult<bool> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let flipped: i64 = self
            .mark_read
            .key(self.record_key(id.as_str()))
            .invoke_async(&mut conn)
            .await?;

        match flipped {
            -1 => Err(NotificationError::not_found(id.as_str())),
            0 => Ok(false),
            _ => Ok(true),
        }
    }

    async fn get(&self, id: &NotificationId) -> NotifyResult<Option<Notification>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let (data, read): (Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(self.record_key(id.as_str()))
            .arg("data")
            .arg("read")
            .query_async(&mut conn)
            .await?;

        match data {
            Some(data) => Ok(Some(decode(id.as_str(), &data, read.as_deref().unwrap_or("0"))?)),
            None => Ok(None),
        }
    }
}
