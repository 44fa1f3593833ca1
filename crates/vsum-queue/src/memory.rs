//! In-process job store.
//!
//! Used by tests and single-process deployments. Jobs live only as long as
//! the process; transitions are the same ones the Redis scripts perform.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;
use vsum_models::{JobId, JobStatus};

use crate::clock::{Clock, SystemClock};
use crate::error::{QueueError, QueueResult};
use crate::job::QueueJob;
use crate::metrics;
use crate::policy::{EnqueueOptions, FailOutcome, FailureKind};
use crate::store::{JobRecord, JobStore, Lease, QueueStats, Retention};

struct Entry {
    record: JobRecord,
    /// Insertion order, breaks ties between jobs with equal `available_at`.
    seq: u64,
    /// Order in which the job reached a terminal state.
    finished_seq: u64,
}

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, Entry>,
    dedup: HashMap<String, JobId>,
    seq: u64,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn release_dedup(&mut self, record: &JobRecord) {
        if let Some(key) = &record.dedup_key {
            if self.dedup.get(key) == Some(&record.id) {
                self.dedup.remove(key);
            }
        }
    }

    /// Drop the oldest finished jobs in `stream` beyond `keep`.
    fn prune(&mut self, stream: &str, status: JobStatus, keep: usize) {
        let mut finished: Vec<(u64, JobId)> = self
            .jobs
            .values()
            .filter(|e| e.record.stream == stream && e.record.status == status)
            .map(|e| (e.finished_seq, e.record.id.clone()))
            .collect();
        if finished.len() <= keep {
            return;
        }
        finished.sort();
        let excess = finished.len() - keep;
        for (_, id) in finished.into_iter().take(excess) {
            self.jobs.remove(&id);
        }
    }
}

/// Mutex-guarded job table.
#[derive(Clone)]
pub struct MemoryJobStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
    retention: Retention,
}

impl Default for MemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
            retention: Retention::default(),
        }
    }

    /// Set the retention caps.
    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn dead_lettered(&self, state: &mut State, id: &JobId) {
        let seq = state.next_seq();
        let Some(entry) = state.jobs.get_mut(id) else {
            return;
        };
        entry.finished_seq = seq;
        let record = entry.record.clone();
        state.release_dedup(&record);
        warn!(
            job_id = %record.id,
            stream = %record.stream,
            attempts = record.attempts,
            last_error = record.last_error.as_deref().unwrap_or(""),
            "Job moved to dead-letter set"
        );
        metrics::record_dead_lettered(&record.stream);
        state.prune(&record.stream, JobStatus::DeadLettered, self.retention.dead_lettered);
    }

    fn reclaim_expired(&self, state: &mut State, stream: &str) {
        let now = self.clock.now();
        let expired: Vec<JobId> = state
            .jobs
            .values()
            .filter(|e| e.record.stream == stream && e.record.lease_expired(now))
            .map(|e| e.record.id.clone())
            .collect();

        for id in expired {
            let Some(entry) = state.jobs.get_mut(&id) else {
                continue;
            };
            let outcome = entry.record.reclaim(now);
            metrics::record_reclaimed(stream);
            match outcome {
                FailOutcome::DeadLettered { .. } => self.dead_lettered(state, &id),
                FailOutcome::Retrying { attempt, .. } => {
                    debug!(job_id = %id, stream, attempt, "Reclaimed expired lease");
                }
            }
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn enqueue(
        &self,
        stream: &str,
        payload: QueueJob,
        options: EnqueueOptions,
    ) -> QueueResult<JobId> {
        let mut state = self.lock();

        if let Some(key) = &options.dedup_key {
            if let Some(existing) = state.dedup.get(key) {
                metrics::record_deduplicated(stream);
                return Ok(existing.clone());
            }
        }

        let record = JobRecord::new(stream, payload, &options, self.clock.now());
        let id = record.id.clone();
        if let Some(key) = &record.dedup_key {
            state.dedup.insert(key.clone(), id.clone());
        }
        let seq = state.next_seq();
        state.jobs.insert(
            id.clone(),
            Entry {
                record,
                seq,
                finished_seq: 0,
            },
        );
        metrics::record_enqueued(stream);
        Ok(id)
    }

    async fn lease(&self, stream: &str, duration: Duration) -> QueueResult<Option<Lease>> {
        let mut state = self.lock();
        self.reclaim_expired(&mut state, stream);

        let now = self.clock.now();
        let next = state
            .jobs
            .values()
            .filter(|e| e.record.stream == stream && e.record.is_ready(now))
            .min_by_key(|e| (e.record.available_at, e.seq))
            .map(|e| e.record.id.clone());

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(entry) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };

        let token = Uuid::new_v4().to_string();
        entry.record.grant_lease(token.clone(), now, duration);
        let expires_at = entry
            .record
            .lease
            .as_ref()
            .map(|l| l.expires_at)
            .unwrap_or(now);

        Ok(Some(Lease {
            job: entry.record.clone(),
            token,
            expires_at,
        }))
    }

    async fn ack(&self, lease: &Lease) -> QueueResult<()> {
        let mut state = self.lock();
        let now = self.clock.now();
        let seq = state.next_seq();

        let entry = state
            .jobs
            .get_mut(lease.job_id())
            .filter(|e| e.record.holds(&lease.token))
            .ok_or_else(|| QueueError::LeaseLost(lease.job_id().to_string()))?;
        entry.record.complete(now);
        entry.finished_seq = seq;
        let record = entry.record.clone();

        state.release_dedup(&record);
        state.prune(&record.stream, JobStatus::Completed, self.retention.completed);
        Ok(())
    }

    async fn fail(
        &self,
        lease: &Lease,
        kind: FailureKind,
        message: &str,
    ) -> QueueResult<FailOutcome> {
        let mut state = self.lock();
        let now = self.clock.now();

        let entry = state
            .jobs
            .get_mut(lease.job_id())
            .filter(|e| e.record.holds(&lease.token))
            .ok_or_else(|| QueueError::LeaseLost(lease.job_id().to_string()))?;
        let outcome = entry.record.record_failure(kind, message, now);

        if outcome.is_dead_lettered() {
            self.dead_lettered(&mut state, lease.job_id());
        }
        Ok(outcome)
    }

    async fn get(&self, id: &JobId) -> QueueResult<Option<JobRecord>> {
        Ok(self.lock().jobs.get(id).map(|e| e.record.clone()))
    }

    async fn stats(&self, stream: &str) -> QueueResult<QueueStats> {
        let mut state = self.lock();
        self.reclaim_expired(&mut state, stream);

        let mut stats = QueueStats::default();
        for entry in state.jobs.values().filter(|e| e.record.stream == stream) {
            match entry.record.status {
                JobStatus::Pending | JobStatus::Failed => stats.pending += 1,
                JobStatus::Leased => stats.leased += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::DeadLettered => stats.dead_lettered += 1,
            }
        }
        Ok(stats)
    }

    async fn dead_letters(&self, stream: &str, limit: usize) -> QueueResult<Vec<JobRecord>> {
        let state = self.lock();
        let mut dead: Vec<&Entry> = state
            .jobs
            .values()
            .filter(|e| e.record.stream == stream && e.record.status == JobStatus::DeadLettered)
            .collect();
        dead.sort_by(|a, b| b.finished_seq.cmp(&a.finished_seq));
        Ok(dead
            .into_iter()
            .take(limit)
            .map(|e| e.record.clone())
            .collect())
    }

    async fn redrive(&self, id: &JobId) -> QueueResult<bool> {
        let mut state = self.lock();
        let now = self.clock.now();
        let seq = state.next_seq();

        let Some(entry) = state.jobs.get_mut(id) else {
            return Ok(false);
        };
        if entry.record.status != JobStatus::DeadLettered {
            return Ok(false);
        }
        entry.record.redrive(now);
        entry.seq = seq;
        let dedup_key = entry.record.dedup_key.clone();

        if let Some(key) = dedup_key {
            state.dedup.entry(key).or_insert_with(|| id.clone());
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::job::UploadJobPayload;
    use crate::policy::BackoffPolicy;
    use chrono::Utc;
    use std::collections::HashSet;

    const STREAM: &str = "upload";
    const LEASE: Duration = Duration::from_secs(30);

    fn payload(n: u8) -> QueueJob {
        QueueJob::Upload(UploadJobPayload::new(
            "user_1",
            format!("video {n}"),
            "v.mp4",
            "video/mp4",
            vec![n],
        ))
    }

    fn store_with_clock() -> (MemoryJobStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        (MemoryJobStore::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn lease_returns_jobs_in_fifo_order() {
        let store = MemoryJobStore::new();
        let first = store
            .enqueue(STREAM, payload(1), EnqueueOptions::default())
            .await
            .unwrap();
        let second = store
            .enqueue(STREAM, payload(2), EnqueueOptions::default())
            .await
            .unwrap();

        let a = store.lease(STREAM, LEASE).await.unwrap().unwrap();
        let b = store.lease(STREAM, LEASE).await.unwrap().unwrap();
        assert_eq!(a.job_id(), &first);
        assert_eq!(b.job_id(), &second);
        assert!(store.lease(STREAM, LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn streams_are_independent() {
        let store = MemoryJobStore::new();
        store
            .enqueue(STREAM, payload(1), EnqueueOptions::default())
            .await
            .unwrap();
        assert!(store.lease("summarize", LEASE).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_leasers_never_share_a_job() {
        let store = MemoryJobStore::new();
        for n in 0..50 {
            store
                .enqueue(STREAM, payload(n), EnqueueOptions::default())
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(lease) = store.lease(STREAM, LEASE).await.unwrap() {
                    got.push(lease.job_id().clone());
                    tokio::task::yield_now().await;
                }
                got
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for id in handle.await.unwrap() {
                total += 1;
                assert!(seen.insert(id), "job leased twice");
            }
        }
        assert_eq!(total, 50);
    }

    #[tokio::test]
    async fn ack_completes_and_rejects_stale_token() {
        let (store, clock) = store_with_clock();
        let id = store
            .enqueue(STREAM, payload(1), EnqueueOptions::default())
            .await
            .unwrap();

        let stale = store.lease(STREAM, LEASE).await.unwrap().unwrap();
        clock.advance(LEASE + Duration::from_secs(1));
        let fresh = store.lease(STREAM, LEASE).await.unwrap().unwrap();
        assert_eq!(fresh.job_id(), &id);

        let err = store.ack(&stale).await.unwrap_err();
        assert!(err.is_lease_lost());

        store.ack(&fresh).await.unwrap();
        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(store.stats(STREAM).await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn backoff_is_monotonic_and_respected() {
        let (store, clock) = store_with_clock();
        let backoff = BackoffPolicy::exponential(Duration::from_secs(3), Duration::from_secs(300));
        store
            .enqueue(STREAM, payload(1), EnqueueOptions::new(4, backoff))
            .await
            .unwrap();

        let mut last_delay = Duration::ZERO;
        let mut last_available = None;
        for expected_attempt in 1..=3u32 {
            let lease = store.lease(STREAM, LEASE).await.unwrap().unwrap();
            let now = clock.now();
            let outcome = store
                .fail(&lease, FailureKind::Retryable, "transient")
                .await
                .unwrap();

            let FailOutcome::Retrying {
                attempt,
                available_at,
            } = outcome
            else {
                panic!("expected retry, got {outcome:?}");
            };
            assert_eq!(attempt, expected_attempt);

            let delay = (available_at - now).to_std().unwrap();
            assert_eq!(delay, backoff.delay(attempt));
            assert!(delay >= last_delay);
            if let Some(prev) = last_available {
                assert!(available_at > prev);
            }
            last_delay = delay;
            last_available = Some(available_at);

            assert!(store.lease(STREAM, LEASE).await.unwrap().is_none());
            clock.advance(delay);
        }
    }

    #[tokio::test]
    async fn exhausting_attempts_dead_letters() {
        let store = MemoryJobStore::new();
        let id = store
            .enqueue(STREAM, payload(1), EnqueueOptions::new(3, BackoffPolicy::Immediate))
            .await
            .unwrap();

        let mut outcome = None;
        for _ in 0..3 {
            let lease = store.lease(STREAM, LEASE).await.unwrap().unwrap();
            outcome = Some(store.fail(&lease, FailureKind::Retryable, "nope").await.unwrap());
        }
        assert_eq!(outcome, Some(FailOutcome::DeadLettered { attempts: 3 }));
        assert!(store.lease(STREAM, LEASE).await.unwrap().is_none());

        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::DeadLettered);
        assert_eq!(record.attempts, 3);

        let dead = store.dead_letters(STREAM, 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, id);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_and_eventually_dead_lettered() {
        let (store, clock) = store_with_clock();
        let id = store
            .enqueue(STREAM, payload(1), EnqueueOptions::new(2, BackoffPolicy::Immediate))
            .await
            .unwrap();

        store.lease(STREAM, LEASE).await.unwrap().unwrap();
        clock.advance(LEASE);
        let second = store.lease(STREAM, LEASE).await.unwrap().unwrap();
        assert_eq!(second.job_id(), &id);
        assert_eq!(second.job.attempts, 1);
        assert_eq!(second.attempt(), 2);

        clock.advance(LEASE);
        assert!(store.lease(STREAM, LEASE).await.unwrap().is_none());
        let record = store.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::DeadLettered);
        assert_eq!(record.last_error.as_deref(), Some("lease expired"));
    }

    #[tokio::test]
    async fn dedup_key_returns_existing_live_job() {
        let store = MemoryJobStore::new();
        let opts = EnqueueOptions::default().with_dedup_key("summarize:u:v");

        let a = store.enqueue(STREAM, payload(1), opts.clone()).await.unwrap();
        let b = store.enqueue(STREAM, payload(2), opts.clone()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.stats(STREAM).await.unwrap().pending, 1);

        let lease = store.lease(STREAM, LEASE).await.unwrap().unwrap();
        store.ack(&lease).await.unwrap();

        let c = store.enqueue(STREAM, payload(3), opts).await.unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn redrive_resets_dead_letter() {
        let store = MemoryJobStore::new();
        let id = store
            .enqueue(STREAM, payload(1), EnqueueOptions::new(1, BackoffPolicy::Immediate))
            .await
            .unwrap();
        let lease = store.lease(STREAM, LEASE).await.unwrap().unwrap();
        store.fail(&lease, FailureKind::Terminal, "bad").await.unwrap();

        assert!(store.redrive(&id).await.unwrap());
        assert!(!store.redrive(&id).await.unwrap());

        let lease = store.lease(STREAM, LEASE).await.unwrap().unwrap();
        assert_eq!(lease.job_id(), &id);
        assert_eq!(lease.job.attempts, 0);
    }

    #[tokio::test]
    async fn completed_jobs_are_capped() {
        let store = MemoryJobStore::new().with_retention(Retention {
            completed: 2,
            ..Retention::default()
        });
        let mut ids = Vec::new();
        for n in 0..4 {
            ids.push(
                store
                    .enqueue(STREAM, payload(n), EnqueueOptions::default())
                    .await
                    .unwrap(),
            );
            let lease = store.lease(STREAM, LEASE).await.unwrap().unwrap();
            store.ack(&lease).await.unwrap();
        }

        assert_eq!(store.stats(STREAM).await.unwrap().completed, 2);
        assert!(store.get(&ids[0]).await.unwrap().is_none());
        assert!(store.get(&ids[3]).await.unwrap().is_some());
    }
}
