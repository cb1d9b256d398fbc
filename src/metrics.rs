//! Metrics for observability.
//!
//! Records through the `metrics` facade:
//! - Poll throughput and latency
//! - Per-event outcomes (applied, duplicate, rejected, failed)
//! - Offset commits and dead-lettering
//! - Producer attempts
//! - Target store busy retries and ledger near-misses
//!
//! No exporter is installed by this crate; the embedding process chooses one.
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `article_sync_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration)
//!
//! # Usage
//!
//! ```rust,no_run
//! use article_sync::metrics;
//! use std::time::Duration;
//!
//! metrics::record_messages_polled("article-events", 10, Duration::from_millis(3));
//! metrics::record_event_outcome("article.created", "applied");
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Consumer
// =============================================================================

/// Record a successful poll and how many messages it returned.
pub fn record_messages_polled(topic: &str, count: usize, duration: Duration) {
    counter!("article_sync_messages_received_total", "topic" => topic.to_string())
        .increment(count as u64);
    histogram!("article_sync_poll_duration_seconds", "topic" => topic.to_string())
        .record(duration.as_secs_f64());
}

/// Record a failed poll.
pub fn record_poll_error(topic: &str) {
    counter!("article_sync_poll_errors_total", "topic" => topic.to_string()).increment(1);
}

/// Record the outcome of handing a decoded event to the sync engine.
///
/// `outcome` is one of `applied`, `already_applied`, `already_absent`.
pub fn record_event_outcome(event_type: &str, outcome: &str) {
    counter!(
        "article_sync_events_total",
        "event_type" => event_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record an envelope rejected at the decode boundary.
pub fn record_event_rejected(reason: &str) {
    counter!("article_sync_events_rejected_total", "reason" => reason.to_string()).increment(1);
}

/// Record a failed apply.
pub fn record_apply_failure(event_type: &str, error_kind: &str) {
    counter!(
        "article_sync_apply_failures_total",
        "event_type" => event_type.to_string(),
        "error" => error_kind.to_string()
    )
    .increment(1);
}

/// Record time spent in the sync engine for one event.
pub fn record_apply_latency(event_type: &str, duration: Duration) {
    histogram!("article_sync_apply_duration_seconds", "event_type" => event_type.to_string())
        .record(duration.as_secs_f64());
}

/// Record an offset commit.
pub fn record_commit(topic: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("article_sync_commits_total", "topic" => topic.to_string(), "status" => status)
        .increment(1);
}

/// Record a message parked on the dead-letter topic.
pub fn record_dead_letter(topic: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("article_sync_dead_letters_total", "topic" => topic.to_string(), "status" => status)
        .increment(1);
}

/// Record a failed message committed without being applied.
pub fn record_dropped(event_type: &str) {
    counter!("article_sync_events_dropped_total", "event_type" => event_type.to_string())
        .increment(1);
}

/// Gauge for consumer state.
pub fn set_consumer_state(state: &str) {
    let value = match state {
        "Stopped" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "Stopping" => 3.0,
        _ => -1.0,
    };
    gauge!("article_sync_consumer_state").set(value);
}

// =============================================================================
// Target store
// =============================================================================

/// Record a ledger write that failed after its data write succeeded.
pub fn record_ledger_near_miss() {
    counter!("article_sync_ledger_near_miss_total").increment(1);
}

/// Record a SQLite busy/locked retry.
pub fn store_retries_total(operation: &str) {
    counter!("article_sync_store_retries_total", "operation" => operation.to_string())
        .increment(1);
}

/// Record a startup connection attempt against the broker or the store.
pub fn record_connection(target: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("article_sync_connections_total", "target" => target.to_string(), "status" => status)
        .increment(1);
}

// =============================================================================
// Producer
// =============================================================================

/// Record a publish that completed (successfully or not).
pub fn record_publish(event_type: &str, success: bool, attempts: usize, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "article_sync_publish_total",
        "event_type" => event_type.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!("article_sync_publish_attempts", "event_type" => event_type.to_string())
        .record(attempts as f64);
    histogram!("article_sync_publish_duration_seconds", "event_type" => event_type.to_string())
        .record(duration.as_secs_f64());
}

/// Record a retried send.
pub fn record_publish_retry(event_type: &str) {
    counter!("article_sync_publish_retries_total", "event_type" => event_type.to_string())
        .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    // With no recorder installed these are no-ops; the tests make sure the
    // label sets are well-formed and nothing panics.

    #[test]
    fn test_record_messages_polled() {
        record_messages_polled("article-events", 10, Duration::from_millis(5));
        record_messages_polled("article-events", 0, Duration::ZERO);
    }

    #[test]
    fn test_record_event_outcomes() {
        record_event_outcome("article.created", "applied");
        record_event_outcome("article.created", "already_applied");
        record_event_outcome("article.deleted", "already_absent");
    }

    #[test]
    fn test_record_rejections_and_failures() {
        record_event_rejected("missing_field");
        record_apply_failure("article.updated", "store");
        record_dropped("article.updated");
        record_poll_error("article-events");
    }

    #[test]
    fn test_record_commit_and_dead_letter() {
        record_commit("article-events", true);
        record_commit("article-events", false);
        record_dead_letter("article-events", true);
        record_dead_letter("article-events", false);
    }

    #[test]
    fn test_set_consumer_state_all_states() {
        set_consumer_state("Stopped");
        set_consumer_state("Starting");
        set_consumer_state("Running");
        set_consumer_state("Stopping");
        set_consumer_state("Unknown");
    }

    #[test]
    fn test_store_and_producer_metrics() {
        record_ledger_near_miss();
        store_retries_total("apply");
        record_connection("store", true);
        record_connection("broker", false);
        record_publish("article.created", true, 1, Duration::from_millis(2));
        record_publish("article.created", false, 3, Duration::from_secs(3));
        record_publish_retry("article.created");
        record_apply_latency("article.created", Duration::from_micros(300));
    }
}
