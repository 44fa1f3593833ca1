//! Redis-backed job store.
//!
//! Layout, with `{p}` the key prefix and `{s}` the stream:
//!
//! - `{p}:job:{id}`: hash with the job's flat fields
//! - `{p}:q:{s}:ready`: zset of leasable ids scored by `available_at` (ms)
//! - `{p}:q:{s}:leased`: zset of leased ids scored by lease expiry (ms)
//! - `{p}:q:{s}:done` / `{p}:q:{s}:dead`: capped lists, newest first
//! - `{p}:dedup:{key}`: id of the live job holding a dedup key
//!
//! Every state transition is one Lua script, so a job moves between sets
//! atomically and two leasers can never claim the same id.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Script};
use tracing::{debug, info, warn};
use uuid::Uuid;
use vsum_models::{JobId, JobStatus};

use crate::clock::{add_std, Clock, SystemClock};
use crate::error::{QueueError, QueueResult};
use crate::job::QueueJob;
use crate::metrics;
use crate::policy::{BackoffPolicy, EnqueueOptions, FailOutcome, FailureKind};
use crate::store::{JobRecord, JobStore, Lease, LeaseInfo, QueueStats, Retention};

/// Shared Lua helpers. Every script receives the key prefix as `ARGV[1]`
/// and the current time in ms as `ARGV[2]`.
macro_rules! lua {
    ($body:literal) => {
        concat!(
            r#"
local function job_key(id) return ARGV[1] .. ':job:' .. id end

local function release_dedup(id)
  local dk = redis.call('HGET', job_key(id), 'dedup_key')
  if dk and dk ~= '' then
    local k = ARGV[1] .. ':dedup:' .. dk
    if redis.call('GET', k) == id then redis.call('DEL', k) end
  end
end

local function retire(list, id, keep, ttl)
  redis.call('LPUSH', list, id)
  redis.call('EXPIRE', job_key(id), ttl)
  while redis.call('LLEN', list) > keep do
    local old = redis.call('RPOP', list)
    if old then redis.call('DEL', job_key(old)) end
  end
end

local function reclaim(ready, leased, dead, keep, ttl)
  local now = ARGV[2]
  local expired = redis.call('ZRANGEBYSCORE', leased, '-inf', now)
  local dead_ids = {}
  for _, id in ipairs(expired) do
    local jk = job_key(id)
    redis.call('ZREM', leased, id)
    local max = tonumber(redis.call('HGET', jk, 'max_attempts')) or 1
    local attempts = math.min((tonumber(redis.call('HGET', jk, 'attempts')) or 0) + 1, max)
    redis.call('HSET', jk, 'attempts', attempts, 'last_error', 'lease expired',
      'lease_token', '', 'lease_expires_at', '', 'updated_at', now)
    if attempts >= max then
      redis.call('HSET', jk, 'status', 'dead_lettered')
      release_dedup(id)
      retire(dead, id, keep, ttl)
      table.insert(dead_ids, id)
    else
      redis.call('HSET', jk, 'status', 'pending', 'available_at', now)
      redis.call('ZADD', ready, now, id)
    end
  end
  return dead_ids
end
"#,
            $body
        )
    };
}

// KEYS: ready. ARGV: prefix, now, id, payload, stream, max_attempts,
// backoff_base_ms, backoff_max_ms, dedup_key.
const ENQUEUE: &str = lua!(
    r#"
if ARGV[9] ~= '' then
  local dkey = ARGV[1] .. ':dedup:' .. ARGV[9]
  local existing = redis.call('GET', dkey)
  if existing then return {0, existing} end
  redis.call('SET', dkey, ARGV[3])
end
redis.call('HSET', job_key(ARGV[3]),
  'id', ARGV[3], 'stream', ARGV[5], 'payload', ARGV[4],
  'attempts', 0, 'max_attempts', ARGV[6],
  'backoff_base_ms', ARGV[7], 'backoff_max_ms', ARGV[8],
  'status', 'pending', 'created_at', ARGV[2], 'available_at', ARGV[2],
  'updated_at', ARGV[2], 'dedup_key', ARGV[9])
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[3])
return {1, ARGV[3]}
"#
);

// KEYS: ready, leased, dead. ARGV: prefix, now, dead_keep, dead_ttl, token, expires_at.
const LEASE: &str = lua!(
    r#"
local dead_ids = reclaim(KEYS[1], KEYS[2], KEYS[3], tonumber(ARGV[3]), ARGV[4])
while true do
  local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[2], 'LIMIT', 0, 1)
  if #ids == 0 then return {dead_ids, {}} end
  local id = ids[1]
  local jk = job_key(id)
  redis.call('ZREM', KEYS[1], id)
  if redis.call('EXISTS', jk) == 1 then
    redis.call('HSET', jk, 'status', 'leased', 'lease_token', ARGV[5],
      'lease_expires_at', ARGV[6], 'updated_at', ARGV[2])
    redis.call('ZADD', KEYS[2], ARGV[6], id)
    return {dead_ids, redis.call('HGETALL', jk)}
  end
end
"#
);

// KEYS: leased, done. ARGV: prefix, now, id, token, done_keep, done_ttl.
const ACK: &str = lua!(
    r#"
local jk = job_key(ARGV[3])
if redis.call('HGET', jk, 'status') ~= 'leased' or redis.call('HGET', jk, 'lease_token') ~= ARGV[4] then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[3])
redis.call('HSET', jk, 'status', 'completed', 'lease_token', '', 'lease_expires_at', '',
  'updated_at', ARGV[2])
release_dedup(ARGV[3])
retire(KEYS[2], ARGV[3], tonumber(ARGV[5]), ARGV[6])
return 1
"#
);

// KEYS: ready, leased, dead. ARGV: prefix, now, id, token, terminal, message,
// retry_at, dead_keep, dead_ttl.
const FAIL: &str = lua!(
    r#"
local jk = job_key(ARGV[3])
if redis.call('HGET', jk, 'status') ~= 'leased' or redis.call('HGET', jk, 'lease_token') ~= ARGV[4] then
  return {-1, 0}
end
redis.call('ZREM', KEYS[2], ARGV[3])
local max = tonumber(redis.call('HGET', jk, 'max_attempts')) or 1
local attempts = math.min((tonumber(redis.call('HGET', jk, 'attempts')) or 0) + 1, max)
redis.call('HSET', jk, 'attempts', attempts, 'last_error', ARGV[6], 'lease_token', '',
  'lease_expires_at', '', 'updated_at', ARGV[2])
if ARGV[5] == '1' or attempts >= max then
  redis.call('HSET', jk, 'status', 'dead_lettered')
  release_dedup(ARGV[3])
  retire(KEYS[3], ARGV[3], tonumber(ARGV[8]), ARGV[9])
  return {0, attempts}
end
redis.call('HSET', jk, 'status', 'failed', 'available_at', ARGV[7])
redis.call('ZADD', KEYS[1], ARGV[7], ARGV[3])
return {1, attempts}
"#
);

// KEYS: ready, leased, dead, done. ARGV: prefix, now, dead_keep, dead_ttl.
const STATS: &str = lua!(
    r#"
local dead_ids = reclaim(KEYS[1], KEYS[2], KEYS[3], tonumber(ARGV[3]), ARGV[4])
return {
  redis.call('ZCARD', KEYS[1]),
  redis.call('ZCARD', KEYS[2]),
  redis.call('LLEN', KEYS[3]),
  redis.call('LLEN', KEYS[4]),
  #dead_ids
}
"#
);

// ARGV: prefix, now, id.
const REDRIVE: &str = lua!(
    r#"
local jk = job_key(ARGV[3])
if redis.call('HGET', jk, 'status') ~= 'dead_lettered' then return 0 end
local q = ARGV[1] .. ':q:' .. redis.call('HGET', jk, 'stream')
redis.call('LREM', q .. ':dead', 0, ARGV[3])
redis.call('PERSIST', jk)
redis.call('HSET', jk, 'status', 'pending', 'attempts', 0, 'available_at', ARGV[2],
  'updated_at', ARGV[2], 'lease_token', '', 'lease_expires_at', '')
local dk = redis.call('HGET', jk, 'dedup_key')
if dk and dk ~= '' then
  redis.call('SET', ARGV[1] .. ':dedup:' .. dk, ARGV[3], 'NX')
end
redis.call('ZADD', q .. ':ready', ARGV[2], ARGV[3])
return 1
"#
);

/// Job store on Redis.
pub struct RedisJobStore {
    client: redis::Client,
    prefix: String,
    retention: Retention,
    clock: Box<dyn Clock>,
    enqueue: Script,
    lease: Script,
    ack: Script,
    fail: Script,
    stats: Script,
    redrive: Script,
}

impl RedisJobStore {
    pub fn new(redis_url: &str, prefix: impl Into<String>) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            prefix: prefix.into(),
            retention: Retention::default(),
            clock: Box::new(SystemClock),
            enqueue: Script::new(ENQUEUE),
            lease: Script::new(LEASE),
            ack: Script::new(ACK),
            fail: Script::new(FAIL),
            stats: Script::new(STATS),
            redrive: Script::new(REDRIVE),
        })
    }

    /// Set the retention caps.
    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    /// Check that Redis answers.
    pub async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!(prefix = %self.prefix, "Connected to Redis job store");
        Ok(())
    }

    async fn conn(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}:job:{}", self.prefix, id)
    }

    fn stream_key(&self, stream: &str, set: &str) -> String {
        format!("{}:q:{}:{}", self.prefix, stream, set)
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    fn note_dead_lettered(&self, stream: &str, ids: &[String]) {
        for id in ids {
            warn!(job_id = %id, stream, "Expired lease exhausted attempts; job dead-lettered");
            metrics::record_dead_lettered(stream);
        }
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn enqueue(
        &self,
        stream: &str,
        payload: QueueJob,
        options: EnqueueOptions,
    ) -> QueueResult<JobId> {
        let mut conn = self.conn().await?;
        let id = JobId::new();
        let body = serde_json::to_string(&payload)?;
        let (base_ms, max_ms) = options.backoff.as_millis_pair();

        let (created, job_id): (i64, String) = self
            .enqueue
            .key(self.stream_key(stream, "ready"))
            .arg(&self.prefix)
            .arg(self.now_ms())
            .arg(id.as_str())
            .arg(body)
            .arg(stream)
            .arg(options.max_attempts.max(1))
            .arg(base_ms)
            .arg(max_ms)
            .arg(options.dedup_key.as_deref().unwrap_or(""))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| QueueError::enqueue_failed(e.to_string()))?;

        if created == 1 {
            debug!(job_id = %job_id, stream, "Enqueued job");
            metrics::record_enqueued(stream);
        } else {
            debug!(job_id = %job_id, stream, "Dedup key matched live job");
            metrics::record_deduplicated(stream);
        }
        Ok(JobId::from_string(job_id))
    }

    async fn lease(&self, stream: &str, duration: Duration) -> QueueResult<Option<Lease>> {
        let mut conn = self.conn().await?;
        let now = self.clock.now();
        let token = Uuid::new_v4().to_string();
        let expires_at = add_std(now, duration);

        let (dead_ids, fields): (Vec<String>, HashMap<String, String>) = self
            .lease
            .key(self.stream_key(stream, "ready"))
            .key(self.stream_key(stream, "leased"))
            .key(self.stream_key(stream, "dead"))
            .arg(&self.prefix)
            .arg(now.timestamp_millis())
            .arg(self.retention.dead_lettered)
            .arg(self.retention.dead_lettered_ttl.as_secs())
            .arg(&token)
            .arg(expires_at.timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        self.note_dead_lettered(stream, &dead_ids);
        if fields.is_empty() {
            return Ok(None);
        }

        let job = record_from_hash(fields)?;
        Ok(Some(Lease {
            job,
            token,
            expires_at,
        }))
    }

    async fn ack(&self, lease: &Lease) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let stream = &lease.job.stream;

        let acked: i64 = self
            .ack
            .key(self.stream_key(stream, "leased"))
            .key(self.stream_key(stream, "done"))
            .arg(&self.prefix)
            .arg(self.now_ms())
            .arg(lease.job_id().as_str())
            .arg(&lease.token)
            .arg(self.retention.completed)
            .arg(self.retention.completed_ttl.as_secs())
            .invoke_async(&mut conn)
            .await?;

        if acked == 0 {
            return Err(QueueError::LeaseLost(lease.job_id().to_string()));
        }
        Ok(())
    }

    async fn fail(
        &self,
        lease: &Lease,
        kind: FailureKind,
        message: &str,
    ) -> QueueResult<FailOutcome> {
        let mut conn = self.conn().await?;
        let stream = &lease.job.stream;
        let now = self.clock.now();
        let retry_at = add_std(now, lease.job.backoff.delay(lease.attempt()));

        let (code, attempts): (i64, u32) = self
            .fail
            .key(self.stream_key(stream, "ready"))
            .key(self.stream_key(stream, "leased"))
            .key(self.stream_key(stream, "dead"))
            .arg(&self.prefix)
            .arg(now.timestamp_millis())
            .arg(lease.job_id().as_str())
            .arg(&lease.token)
            .arg(if kind == FailureKind::Terminal { "1" } else { "0" })
            .arg(message)
            .arg(retry_at.timestamp_millis())
            .arg(self.retention.dead_lettered)
            .arg(self.retention.dead_lettered_ttl.as_secs())
            .invoke_async(&mut conn)
            .await?;

        match code {
            -1 => Err(QueueError::LeaseLost(lease.job_id().to_string())),
            0 => {
                warn!(
                    job_id = %lease.job_id(),
                    stream = %stream,
                    attempts,
                    error = message,
                    "Job moved to dead-letter set"
                );
                metrics::record_dead_lettered(stream);
                Ok(FailOutcome::DeadLettered { attempts })
            }
            _ => Ok(FailOutcome::Retrying {
                attempt: attempts,
                available_at: retry_at,
            }),
        }
    }

    async fn get(&self, id: &JobId) -> QueueResult<Option<JobRecord>> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> = conn.hgetall(self.job_key(id.as_str())).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        record_from_hash(fields).map(Some)
    }

    async fn stats(&self, stream: &str) -> QueueResult<QueueStats> {
        let mut conn = self.conn().await?;
        let (pending, leased, dead_lettered, completed, reclaimed_dead): (u64, u64, u64, u64, u64) =
            self.stats
                .key(self.stream_key(stream, "ready"))
                .key(self.stream_key(stream, "leased"))
                .key(self.stream_key(stream, "dead"))
                .key(self.stream_key(stream, "done"))
                .arg(&self.prefix)
                .arg(self.now_ms())
                .arg(self.retention.dead_lettered)
                .arg(self.retention.dead_lettered_ttl.as_secs())
                .invoke_async(&mut conn)
                .await?;

        for _ in 0..reclaimed_dead {
            metrics::record_dead_lettered(stream);
        }
        Ok(QueueStats {
            pending,
            leased,
            dead_lettered,
            completed,
        })
    }

    async fn dead_letters(&self, stream: &str, limit: usize) -> QueueResult<Vec<JobRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn
            .lrange(self.stream_key(stream, "dead"), 0, limit as isize - 1)
            .await?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let fields: HashMap<String, String> = conn.hgetall(self.job_key(&id)).await?;
            if fields.is_empty() {
                continue;
            }
            records.push(record_from_hash(fields)?);
        }
        Ok(records)
    }

    async fn redrive(&self, id: &JobId) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let redriven: i64 = self
            .redrive
            .arg(&self.prefix)
            .arg(self.now_ms())
            .arg(id.as_str())
            .invoke_async(&mut conn)
            .await?;

        if redriven == 1 {
            info!(job_id = %id, "Redrove dead-lettered job");
        }
        Ok(redriven == 1)
    }
}

fn field<'a>(fields: &'a HashMap<String, String>, id: &str, name: &str) -> QueueResult<&'a str> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| QueueError::corrupt(id, format!("missing field {name}")))
}

fn parse_num<T: std::str::FromStr>(
    fields: &HashMap<String, String>,
    id: &str,
    name: &str,
) -> QueueResult<T> {
    field(fields, id, name)?
        .parse()
        .map_err(|_| QueueError::corrupt(id, format!("bad number in {name}")))
}

fn parse_millis(fields: &HashMap<String, String>, id: &str, name: &str) -> QueueResult<DateTime<Utc>> {
    let ms: i64 = parse_num(fields, id, name)?;
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| QueueError::corrupt(id, format!("timestamp out of range in {name}")))
}

fn non_empty(fields: &HashMap<String, String>, name: &str) -> Option<String> {
    fields.get(name).filter(|v| !v.is_empty()).cloned()
}

/// Rebuild a record from its hash.
fn record_from_hash(fields: HashMap<String, String>) -> QueueResult<JobRecord> {
    let id = field(&fields, "?", "id")?.to_string();

    let status: JobStatus = field(&fields, &id, "status")?
        .parse()
        .map_err(|e: String| QueueError::corrupt(&id, e))?;
    let payload: QueueJob = serde_json::from_str(field(&fields, &id, "payload")?)
        .map_err(|e| QueueError::corrupt(&id, format!("payload: {e}")))?;

    let lease = match non_empty(&fields, "lease_token") {
        Some(token) => Some(LeaseInfo {
            token,
            expires_at: parse_millis(&fields, &id, "lease_expires_at")?,
        }),
        None => None,
    };

    Ok(JobRecord {
        stream: field(&fields, &id, "stream")?.to_string(),
        payload,
        attempts: parse_num(&fields, &id, "attempts")?,
        max_attempts: parse_num(&fields, &id, "max_attempts")?,
        backoff: BackoffPolicy::from_millis_pair(
            parse_num(&fields, &id, "backoff_base_ms")?,
            parse_num(&fields, &id, "backoff_max_ms")?,
        ),
        status,
        created_at: parse_millis(&fields, &id, "created_at")?,
        available_at: parse_millis(&fields, &id, "available_at")?,
        updated_at: parse_millis(&fields, &id, "updated_at")?,
        lease,
        last_error: non_empty(&fields, "last_error"),
        dedup_key: non_empty(&fields, "dedup_key"),
        id: JobId::from_string(id),
    })
}
