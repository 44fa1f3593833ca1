//! Worker metrics.

use std::time::Duration;

use metrics::{counter, histogram};
use vsum_models::Stage;
use vsum_queue::FailureKind;

pub mod names {
    pub const JOBS_STARTED_TOTAL: &str = "vsum_jobs_started_total";
    pub const JOBS_COMPLETED_TOTAL: &str = "vsum_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "vsum_jobs_failed_total";
    pub const JOBS_TIMED_OUT_TOTAL: &str = "vsum_jobs_timed_out_total";
    pub const JOBS_PANICKED_TOTAL: &str = "vsum_jobs_panicked_total";
    pub const JOB_DURATION_SECONDS: &str = "vsum_job_duration_seconds";
    pub const NOTIFICATIONS_CREATED_TOTAL: &str = "vsum_notifications_created_total";
    pub const PUSH_FAILURES_TOTAL: &str = "vsum_push_failures_total";
}

pub fn record_job_started(stage: Stage) {
    let labels = [("stage", stage.stream())];
    counter!(names::JOBS_STARTED_TOTAL, &labels).increment(1);
}

pub fn record_job_completed(stage: Stage) {
    let labels = [("stage", stage.stream())];
    counter!(names::JOBS_COMPLETED_TOTAL, &labels).increment(1);
}

pub fn record_job_failed(stage: Stage, kind: FailureKind) {
    let kind = match kind {
        FailureKind::Retryable => "retryable",
        FailureKind::Terminal => "terminal",
    };
    let labels = [("stage", stage.stream()), ("kind", kind)];
    counter!(names::JOBS_FAILED_TOTAL, &labels).increment(1);
}

pub fn record_job_timed_out(stage: Stage) {
    let labels = [("stage", stage.stream())];
    counter!(names::JOBS_TIMED_OUT_TOTAL, &labels).increment(1);
}

pub fn record_job_panicked(stage: Stage) {
    let labels = [("stage", stage.stream())];
    counter!(names::JOBS_PANICKED_TOTAL, &labels).increment(1);
}

pub fn record_job_duration(stage: Stage, elapsed: Duration) {
    let labels = [("stage", stage.stream())];
    histogram!(names::JOB_DURATION_SECONDS, &labels).record(elapsed.as_secs_f64());
}

pub fn record_notification_created() {
    counter!(names::NOTIFICATIONS_CREATED_TOTAL).increment(1);
}

pub fn record_push_failure() {
    counter!(names::PUSH_FAILURES_TOTAL).increment(1);
}
