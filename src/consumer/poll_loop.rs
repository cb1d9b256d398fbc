//! Poll loop: sequential poll → decode → apply → commit.
//!
//! One message at a time, in delivery order. An offset is committed only
//! after the message has been dealt with, one way or another:
//!
//! | Message | Action | Committed |
//! |---------|--------|-----------|
//! | Undecodable / invalid envelope | log, count, park if `dead_letter` | immediately |
//! | Applied, duplicate, already absent | count | yes |
//! | Apply failed, policy `drop` | sleep `failure_delay` (cut short by stop), log the loss | after the sleep |
//! | Apply failed, policy `dead_letter` | park with the error text | after parking |
//! | Apply failed, parking failed | fall back to `drop` | after the sleep |
//!
//! # Shutdown
//!
//! The state flag is read between batches. A batch in progress is always
//! finished; in-flight writes are never cancelled.
//!
//! # Poll Errors
//!
//! A failed poll (broker gone mid-run) backs off along
//! [`RetryConfig::polling`] (1s, 2s, 4s …) capped at `max_poll_backoff`,
//! and retries forever. The backoff sleep wakes early
//! when a stop is requested.

use super::types::{ConsumerState, StatsCounters};
use crate::broker::{BrokerMessage, EventSource};
use crate::config::{ConsumerConfig, FailurePolicy};
use crate::error::SyncError;
use crate::event::EventEnvelope;
use crate::metrics;
use crate::resilience::RetryConfig;
use crate::store::{ApplyOutcome, TargetStore};
use crate::sync::SyncEngine;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Granularity at which backoff sleeps re-check the state flag.
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Run until the state flag reads `Stopping`.
pub(crate) async fn run_poll_loop<S: EventSource, T: TargetStore>(
    source: &S,
    engine: &SyncEngine<T>,
    config: &ConsumerConfig,
    state: &AtomicU8,
    stats: &StatsCounters,
) {
    let span = info_span!("poll_loop", topic = %source.topic());

    async move {
        info!(
            batch_size = config.batch_size,
            failure_policy = %config.failure_policy,
            "Starting poll loop"
        );

        let poll_timeout = config.poll_timeout_duration();
        let backoff = poll_backoff(config);
        let mut consecutive_errors = 0usize;

        while !is_stopping(state) {
            let poll_start = Instant::now();
            match source.poll(config.batch_size.max(1), poll_timeout).await {
                Ok(batch) => {
                    if consecutive_errors > 0 {
                        info!(consecutive_errors, "Poll recovered");
                    }
                    consecutive_errors = 0;

                    if batch.is_empty() {
                        continue;
                    }
                    metrics::record_messages_polled(
                        source.topic(),
                        batch.len(),
                        poll_start.elapsed(),
                    );
                    debug!(count = batch.len(), "Polled batch");

                    for message in &batch {
                        process_message(source, engine, config, state, stats, message).await;
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    metrics::record_poll_error(source.topic());
                    let delay = backoff.delay_for_attempt(consecutive_errors);
                    warn!(
                        error = %e,
                        consecutive_errors,
                        backoff_ms = delay.as_millis() as u64,
                        "Poll failed, backing off"
                    );

                    sleep_unless_stopping(delay, state).await;
                }
            }
        }

        info!("Poll loop stopped");
    }
    .instrument(span)
    .await
}

/// Poll error backoff: the polling preset capped at `max_poll_backoff`.
fn poll_backoff(config: &ConsumerConfig) -> RetryConfig {
    let preset = RetryConfig::polling();
    let max_delay = config.max_poll_backoff_duration();
    RetryConfig {
        initial_delay: preset.initial_delay.min(max_delay),
        max_delay,
        ..preset
    }
}

fn is_stopping(state: &AtomicU8) -> bool {
    ConsumerState::from_u8(state.load(Ordering::SeqCst)) == ConsumerState::Stopping
}

async fn sleep_unless_stopping(duration: Duration, state: &AtomicU8) {
    let deadline = tokio::time::Instant::now() + duration;
    while !is_stopping(state) {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return;
        }
        tokio::time::sleep(std::cmp::min(deadline - now, STOP_CHECK_INTERVAL)).await;
    }
}

async fn process_message<S: EventSource, T: TargetStore>(
    source: &S,
    engine: &SyncEngine<T>,
    config: &ConsumerConfig,
    state: &AtomicU8,
    stats: &StatsCounters,
    message: &BrokerMessage,
) {
    StatsCounters::incr(&stats.received);

    let envelope = match EventEnvelope::decode(&message.payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            StatsCounters::incr(&stats.rejected);
            metrics::record_event_rejected(e.reason());
            warn!(
                message_id = %message.id,
                reason = e.reason(),
                error = %e,
                "Rejecting malformed envelope"
            );
            if config.failure_policy == FailurePolicy::DeadLetter {
                park(source, stats, message, &e.to_string()).await;
            }
            commit(source, stats, message).await;
            return;
        }
    };

    let event_type = envelope.event_type.as_str();
    let start = Instant::now();
    let result = engine.handle_event(&envelope).await;
    metrics::record_apply_latency(event_type, start.elapsed());

    match result {
        Ok(outcome) => {
            metrics::record_event_outcome(event_type, outcome.as_str());
            match outcome {
                ApplyOutcome::Applied | ApplyOutcome::AlreadyAbsent => {
                    StatsCounters::incr(&stats.applied)
                }
                ApplyOutcome::AlreadyApplied => StatsCounters::incr(&stats.duplicates),
            }
            commit(source, stats, message).await;
        }
        Err(e) => {
            StatsCounters::incr(&stats.failed);
            metrics::record_apply_failure(event_type, e.kind());
            handle_apply_failure(source, config, state, stats, message, &envelope, &e).await;
        }
    }
}

async fn handle_apply_failure<S: EventSource>(
    source: &S,
    config: &ConsumerConfig,
    state: &AtomicU8,
    stats: &StatsCounters,
    message: &BrokerMessage,
    envelope: &EventEnvelope,
    err: &SyncError,
) {
    if config.failure_policy == FailurePolicy::DeadLetter
        && park(source, stats, message, &err.to_string()).await
    {
        warn!(
            message_id = %message.id,
            event_id = %envelope.event_id(),
            error = %err,
            "Apply failed, event parked on dead-letter topic"
        );
        commit(source, stats, message).await;
        return;
    }

    let delay = config.failure_delay_duration();
    warn!(
        message_id = %message.id,
        event_id = %envelope.event_id(),
        event_type = %envelope.event_type,
        article_id = envelope.article_id(),
        delay_ms = delay.as_millis() as u64,
        error = %err,
        "Apply failed, dropping event after delay"
    );
    // A stop request cuts the delay short; the event is dropped either way.
    sleep_unless_stopping(delay, state).await;
    metrics::record_dropped(envelope.event_type.as_str());
    commit(source, stats, message).await;
}

/// Copy `message` to the dead-letter topic. Returns whether it landed.
async fn park<S: EventSource>(
    source: &S,
    stats: &StatsCounters,
    message: &BrokerMessage,
    reason: &str,
) -> bool {
    match source.dead_letter(message, reason).await {
        Ok(()) => {
            StatsCounters::incr(&stats.dead_lettered);
            metrics::record_dead_letter(source.topic(), true);
            true
        }
        Err(e) => {
            metrics::record_dead_letter(source.topic(), false);
            error!(message_id = %message.id, error = %e, "Failed to park message");
            false
        }
    }
}

async fn commit<S: EventSource>(source: &S, stats: &StatsCounters, message: &BrokerMessage) {
    match source.commit(message).await {
        Ok(()) => {
            StatsCounters::incr(&stats.committed);
            metrics::record_commit(source.topic(), true);
        }
        Err(e) => {
            // The message stays pending and is redelivered on restart;
            // the ledger absorbs the repeat.
            metrics::record_commit(source.topic(), false);
            error!(message_id = %message.id, error = %e, "Failed to commit offset");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::SyncConfig;
    use crate::event::{ArticlePayload, EventType};
    use crate::store::MemoryStore;

    const TOPIC: &str = "article-events";

    fn encoded(event_type: EventType, id: i64, ts: &str) -> Vec<u8> {
        EventEnvelope::with_timestamp(event_type, ts, ArticlePayload::new(id, "T", "C", "A"))
            .encode()
            .unwrap()
    }

    #[tokio::test]
    async fn test_process_message_commits_success_and_duplicate() {
        let broker = MemoryBroker::new();
        let source = broker.source(TOPIC);
        let engine = SyncEngine::new(MemoryStore::new());
        let config = SyncConfig::for_testing(TOPIC).consumer;
        let stats = StatsCounters::default();
        let state = AtomicU8::new(ConsumerState::Running.as_u8());

        let payload = encoded(EventType::Created, 1, "2024-01-01T00:00:00Z");
        broker.publish_raw(TOPIC, payload.clone()).await;
        broker.publish_raw(TOPIC, payload).await;

        let batch = source.poll(10, Duration::ZERO).await.unwrap();
        for message in &batch {
            process_message(&source, &engine, &config, &state, &stats, message).await;
        }

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.applied, 1);
        assert_eq!(snapshot.duplicates, 1);
        assert_eq!(snapshot.committed, 2);
        assert_eq!(broker.pending_count(TOPIC).await, 0);
    }

    #[tokio::test]
    async fn test_process_message_rejects_and_commits_garbage() {
        let broker = MemoryBroker::new();
        let source = broker.source(TOPIC);
        let engine = SyncEngine::new(MemoryStore::new());
        let config = SyncConfig::for_testing(TOPIC).consumer;
        let stats = StatsCounters::default();
        let state = AtomicU8::new(ConsumerState::Running.as_u8());

        broker.publish_raw(TOPIC, "not json").await;
        let batch = source.poll(10, Duration::ZERO).await.unwrap();
        process_message(&source, &engine, &config, &state, &stats, &batch[0]).await;

        assert_eq!(stats.snapshot().rejected, 1);
        assert_eq!(stats.snapshot().committed, 1);
        assert!(broker.dead_letters(TOPIC).await.is_empty());
    }

    #[tokio::test]
    async fn test_process_message_parks_garbage_under_dead_letter() {
        let broker = MemoryBroker::new();
        let source = broker.source(TOPIC);
        let engine = SyncEngine::new(MemoryStore::new());
        let mut config = SyncConfig::for_testing(TOPIC).consumer;
        config.failure_policy = FailurePolicy::DeadLetter;
        let stats = StatsCounters::default();
        let state = AtomicU8::new(ConsumerState::Running.as_u8());

        broker.publish_raw(TOPIC, "{}").await;
        let batch = source.poll(10, Duration::ZERO).await.unwrap();
        process_message(&source, &engine, &config, &state, &stats, &batch[0]).await;

        let parked = broker.dead_letters(TOPIC).await;
        assert_eq!(parked.len(), 1);
        assert!(parked[0].reason.contains("event_type"));
        assert_eq!(stats.snapshot().committed, 1);
    }

    #[test]
    fn test_poll_backoff_follows_polling_preset() {
        let mut config = SyncConfig::for_testing(TOPIC).consumer;
        config.max_poll_backoff = "60s".to_string();
        let backoff = poll_backoff(&config);
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(backoff.delay_for_attempt(20), Duration::from_secs(60));

        config.max_poll_backoff = "50ms".to_string();
        let backoff = poll_backoff(&config);
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(50));
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_drop_delay_cut_short_by_stop() {
        let broker = MemoryBroker::new();
        let source = broker.source(TOPIC);
        let mut config = SyncConfig::for_testing(TOPIC).consumer;
        config.failure_delay = "60s".to_string();
        let stats = StatsCounters::default();
        let state = AtomicU8::new(ConsumerState::Stopping.as_u8());

        broker
            .publish_raw(TOPIC, encoded(EventType::Created, 1, "2024-01-01T00:00:00Z"))
            .await;
        let batch = source.poll(10, Duration::ZERO).await.unwrap();
        let envelope = EventEnvelope::decode(&batch[0].payload).unwrap();
        let err = SyncError::StoreConnect("down".to_string());

        let start = Instant::now();
        handle_apply_failure(&source, &config, &state, &stats, &batch[0], &envelope, &err).await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(stats.snapshot().committed, 1);
        assert_eq!(broker.pending_count(TOPIC).await, 0);
    }

    #[tokio::test]
    async fn test_sleep_unless_stopping_wakes_early() {
        let state = AtomicU8::new(ConsumerState::Stopping.as_u8());
        let start = Instant::now();
        sleep_unless_stopping(Duration::from_secs(30), &state).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
