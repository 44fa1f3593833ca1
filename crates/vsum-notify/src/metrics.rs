//! Push channel metrics.

use metrics::{counter, gauge};

pub mod names {
    pub const PUSH_DELIVERED_TOTAL: &str = "vsum_push_delivered_total";
    pub const PUSH_DROPPED_TOTAL: &str = "vsum_push_dropped_total";
    pub const PUSH_ACTIVE_SESSIONS: &str = "vsum_push_active_sessions";
}

pub fn record_delivered(event: &'static str, count: usize) {
    let labels = [("event", event)];
    counter!(names::PUSH_DELIVERED_TOTAL, &labels).increment(count as u64);
}

pub fn record_dropped(reason: &'static str) {
    let labels = [("reason", reason)];
    counter!(names::PUSH_DROPPED_TOTAL, &labels).increment(1);
}

pub fn set_active_sessions(count: usize) {
    gauge!(names::PUSH_ACTIVE_SESSIONS).set(count as f64);
}
