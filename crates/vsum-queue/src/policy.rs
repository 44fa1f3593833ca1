//! Retry policy: backoff, attempt limits and failure classification.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delay applied before a failed job becomes leasable again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Re-leasable as soon as it fails.
    Immediate,
    /// `base * 2^(attempt - 1)`, capped at `max`.
    Exponential {
        #[serde(with = "millis")]
        base: Duration,
        #[serde(with = "millis")]
        max: Duration,
    },
}

impl BackoffPolicy {
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self::Exponential { base, max }
    }

    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            BackoffPolicy::Immediate => Duration::ZERO,
            BackoffPolicy::Exponential { base, max } => {
                let exp = attempt.saturating_sub(1).min(31);
                base.saturating_mul(2u32.pow(exp)).min(max)
            }
        }
    }

    /// `(base_ms, max_ms)` in the flat form the Redis scripts use. Immediate is `(0, 0)`.
    pub fn as_millis_pair(&self) -> (u64, u64) {
        match *self {
            BackoffPolicy::Immediate => (0, 0),
            BackoffPolicy::Exponential { base, max } => {
                (base.as_millis() as u64, max.as_millis() as u64)
            }
        }
    }

    pub fn from_millis_pair(base_ms: u64, max_ms: u64) -> Self {
        if base_ms == 0 {
            BackoffPolicy::Immediate
        } else {
            BackoffPolicy::Exponential {
                base: Duration::from_millis(base_ms),
                max: Duration::from_millis(max_ms.max(base_ms)),
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Immediate
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Per-job options supplied at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Total executions allowed before dead-lettering (at least 1).
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// While a live job holds this key, enqueueing again returns that job's id.
    pub dedup_key: Option<String>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffPolicy::Immediate,
            dedup_key: None,
        }
    }
}

impl EnqueueOptions {
    pub fn new(max_attempts: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            dedup_key: None,
        }
    }

    /// Set the dedup key.
    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }
}

/// How a handler failure should be treated by the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Transient: reschedule with backoff until attempts run out.
    Retryable,
    /// Permanent: dead-letter now, whatever attempts remain.
    Terminal,
}

/// What happened to a job after `fail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Rescheduled; `attempt` failures recorded so far.
    Retrying {
        attempt: u32,
        available_at: DateTime<Utc>,
    },
    /// Moved to the dead-letter set; never leased again.
    DeadLettered { attempts: u32 },
}

impl FailOutcome {
    pub fn is_dead_lettered(&self) -> bool {
        matches!(self, FailOutcome::DeadLettered { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_delay_doubles() {
        let policy = BackoffPolicy::exponential(Duration::from_millis(100), Duration::from_secs(60));

        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn exponential_delay_is_capped() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(policy.delay(10), Duration::from_secs(5));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn immediate_has_no_delay() {
        assert_eq!(BackoffPolicy::Immediate.delay(4), Duration::ZERO);
    }

    #[test]
    fn millis_pair_roundtrip() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(3), Duration::from_secs(300));
        let (base, max) = policy.as_millis_pair();
        assert_eq!(BackoffPolicy::from_millis_pair(base, max), policy);
        assert_eq!(BackoffPolicy::from_millis_pair(0, 0), BackoffPolicy::Immediate);
    }

    #[test]
    fn max_attempts_is_at_least_one() {
        assert_eq!(EnqueueOptions::new(0, BackoffPolicy::Immediate).max_attempts, 1);
    }
}
