//! Queue metrics.

use metrics::{counter, gauge};

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_ENQUEUED_TOTAL: &str = "vsum_jobs_enqueued_total";
    pub const JOBS_DEDUPLICATED_TOTAL: &str = "vsum_jobs_deduplicated_total";
    pub const JOBS_RECLAIMED_TOTAL: &str = "vsum_jobs_reclaimed_total";
    pub const JOBS_DEAD_LETTERED_TOTAL: &str = "vsum_jobs_dead_lettered_total";
    pub const QUEUE_PENDING: &str = "vsum_queue_pending";
    pub const QUEUE_DLQ_LENGTH: &str = "vsum_queue_dlq_length";
}

pub fn record_enqueued(stream: &str) {
    let labels = [("stream", stream.to_string())];
    counter!(names::JOBS_ENQUEUED_TOTAL, &labels).increment(1);
}

pub fn record_deduplicated(stream: &str) {
    let labels = [("stream", stream.to_string())];
    counter!(names::JOBS_DEDUPLICATED_TOTAL, &labels).increment(1);
}

pub fn record_reclaimed(stream: &str) {
    let labels = [("stream", stream.to_string())];
    counter!(names::JOBS_RECLAIMED_TOTAL, &labels).increment(1);
}

pub fn record_dead_lettered(stream: &str) {
    let labels = [("stream", stream.to_string())];
    counter!(names::JOBS_DEAD_LETTERED_TOTAL, &labels).increment(1);
}

/// Update queue depth gauges from a stats snapshot.
pub fn set_depth(stream: &str, pending: u64, dead_lettered: u64) {
    let labels = [("stream", stream.to_string())];
    gauge!(names::QUEUE_PENDING, &labels).set(pending as f64);
    gauge!(names::QUEUE_DLQ_LENGTH, &labels).set(dead_lettered as f64);
}
