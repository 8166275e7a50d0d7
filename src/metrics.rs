//! Metrics for observability.
//!
//! Prometheus-style metrics via the `metrics` facade, covering:
//! - Router request/response counts
//! - Replicator progress (revisions pushed/pulled, failures)
//! - Checkpoint saves
//! - Change-feed fan-out
//!
//! All metrics are prefixed with `davenport_`; counters end in `_total`,
//! gauges represent current state, histograms track durations.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a handled router request.
pub fn record_request(endpoint: &'static str, http_status: u16) {
    counter!(
        "davenport_requests_total",
        "endpoint" => endpoint,
        "status" => http_status.to_string()
    )
    .increment(1);
}

/// Record revisions pushed to a remote in one batch.
pub fn record_revs_pushed(remote: &str, count: usize) {
    counter!("davenport_revisions_pushed_total", "remote" => remote.to_string())
        .increment(count as u64);
}

/// Record revisions pulled from a remote in one batch.
pub fn record_revs_pulled(remote: &str, count: usize) {
    counter!("davenport_revisions_pulled_total", "remote" => remote.to_string())
        .increment(count as u64);
}

/// Record revisions that failed to transfer (will enter the retry cycle).
pub fn record_revs_failed(remote: &str, count: usize) {
    counter!("davenport_revisions_failed_total", "remote" => remote.to_string())
        .increment(count as u64);
}

/// Record a checkpoint save attempt.
pub fn record_checkpoint_save(remote: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "davenport_checkpoint_saves_total",
        "remote" => remote.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record one `process_inbox` invocation.
pub fn record_inbox_flush(remote: &str, batch_size: usize, duration: Duration) {
    counter!("davenport_inbox_flushes_total", "remote" => remote.to_string()).increment(1);
    histogram!("davenport_inbox_batch_size", "remote" => remote.to_string())
        .record(batch_size as f64);
    histogram!("davenport_inbox_flush_duration_seconds", "remote" => remote.to_string())
        .record(duration.as_secs_f64());
}

/// Record the number of running replicators.
pub fn set_active_replicators(count: usize) {
    gauge!("davenport_active_replicators").set(count as f64);
}

/// Record a replicator online/offline transition.
pub fn record_replicator_transition(remote: &str, state: &'static str) {
    counter!(
        "davenport_replicator_transitions_total",
        "remote" => remote.to_string(),
        "state" => state
    )
    .increment(1);
}

/// Record rows delivered on a `_changes` feed response.
pub fn record_changes_rows(feed: &'static str, count: usize) {
    counter!("davenport_changes_rows_total", "feed" => feed).increment(count as u64);
}

#[cfg(test)]
mod tests {
    use super::*;

    // The metrics facade is a no-op without an installed recorder; these
    // exercise the call paths for panics only.
    #[test]
    fn test_metric_helpers_do_not_panic() {
        record_request("_changes", 200);
        record_revs_pushed("http://peer/db", 10);
        record_revs_pulled("http://peer/db", 3);
        record_revs_failed("http://peer/db", 1);
        record_checkpoint_save("http://peer/db", true);
        record_checkpoint_save("http://peer/db", false);
        record_inbox_flush("http://peer/db", 42, Duration::from_millis(7));
        set_active_replicators(2);
        record_replicator_transition("http://peer/db", "online");
        record_changes_rows("longpoll", 5);
    }
}
