//! In-process broker with consumer-group-like semantics.
//!
//! One [`MemoryBroker`] holds any number of topics, each an append-only log
//! with a single implicit consumer group:
//!
//! - `poll` hands out undelivered entries and marks them pending
//! - `commit` removes an entry from pending
//! - a fresh [`MemorySource`] (a "restarted consumer") first redelivers
//!   everything still pending, like Redis does for `XREADGROUP ... 0`
//!
//! Failure injection (`fail_next_sends`, `fail_next_polls`,
//! `fail_dead_letters`) lets tests drive the retry and fallback paths.

use crate::broker::{BrokerMessage, EventSink, EventSource};
use crate::error::{BoxFuture, SyncError};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// A message parked on a dead-letter topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub id: String,
    pub payload: Vec<u8>,
    pub reason: String,
    pub source_id: String,
}

#[derive(Default)]
struct TopicLog {
    entries: Vec<(String, Vec<u8>)>,
    /// Index of the first entry never delivered.
    next_undelivered: usize,
    /// Indices delivered but not committed.
    pending: BTreeSet<usize>,
    committed: usize,
    dead_letters: Vec<DeadLetter>,
}

#[derive(Default)]
struct Inner {
    topics: Mutex<HashMap<String, TopicLog>>,
    notify: Notify,
    next_id: AtomicU64,
    fail_sends: AtomicUsize,
    fail_polls: AtomicUsize,
    fail_dead_letters: AtomicBool,
}

impl Inner {
    fn next_id(&self) -> String {
        format!("{}-0", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Decrement a failure budget; `true` if this call should fail.
    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Shared in-process broker. Cloning shares the same topics.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A consumer on `topic`. Redelivers pending entries before new ones.
    pub fn source(&self, topic: &str) -> MemorySource {
        MemorySource {
            broker: self.clone(),
            topic: topic.to_string(),
            replay_pending: AtomicBool::new(true),
        }
    }

    /// Append raw bytes to a topic (bypassing failure injection).
    pub async fn publish_raw(&self, topic: &str, payload: impl Into<Vec<u8>>) -> String {
        let id = self.inner.next_id();
        self.inner
            .topics
            .lock()
            .await
            .entry(topic.to_string())
            .or_default()
            .entries
            .push((id.clone(), payload.into()));
        self.inner.notify.notify_waiters();
        id
    }

    /// Every payload ever appended to `topic`, in order.
    pub async fn messages(&self, topic: &str) -> Vec<Vec<u8>> {
        self.inner
            .topics
            .lock()
            .await
            .get(topic)
            .map(|log| log.entries.iter().map(|(_, p)| p.clone()).collect())
            .unwrap_or_default()
    }

    /// Delivered but uncommitted entries on `topic`.
    pub async fn pending_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .await
            .get(topic)
            .map(|log| log.pending.len())
            .unwrap_or(0)
    }

    /// Commits performed on `topic`.
    pub async fn committed_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .await
            .get(topic)
            .map(|log| log.committed)
            .unwrap_or(0)
    }

    /// Messages parked from `topic`.
    pub async fn dead_letters(&self, topic: &str) -> Vec<DeadLetter> {
        self.inner
            .topics
            .lock()
            .await
            .get(topic)
            .map(|log| log.dead_letters.clone())
            .unwrap_or_default()
    }

    /// Fail the next `n` sends with a retryable broker error.
    pub fn fail_next_sends(&self, n: usize) {
        self.inner.fail_sends.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` polls with a retryable broker error.
    pub fn fail_next_polls(&self, n: usize) {
        self.inner.fail_polls.store(n, Ordering::SeqCst);
    }

    /// Make every dead-letter attempt fail (or succeed again).
    pub fn fail_dead_letters(&self, fail: bool) {
        self.inner.fail_dead_letters.store(fail, Ordering::SeqCst);
    }

    fn take_batch(
        log: &mut TopicLog,
        topic: &str,
        max: usize,
        replay_pending: bool,
    ) -> Vec<BrokerMessage> {
        let indices: Vec<usize> = if replay_pending {
            log.pending.iter().copied().take(max).collect()
        } else {
            let end = (log.next_undelivered + max).min(log.entries.len());
            let range: Vec<usize> = (log.next_undelivered..end).collect();
            log.next_undelivered = end;
            log.pending.extend(range.iter().copied());
            range
        };

        indices
            .into_iter()
            .map(|i| {
                let (id, payload) = &log.entries[i];
                BrokerMessage {
                    id: id.clone(),
                    topic: topic.to_string(),
                    payload: payload.clone(),
                }
            })
            .collect()
    }
}

impl EventSink for MemoryBroker {
    fn send(&self, topic: &str, payload: Vec<u8>) -> BoxFuture<'_, String> {
        let topic = topic.to_string();
        Box::pin(async move {
            if Inner::take_failure(&self.inner.fail_sends) {
                return Err(SyncError::broker_msg("XADD", "injected send failure"));
            }
            Ok(self.publish_raw(&topic, payload).await)
        })
    }
}

/// One consumer on a [`MemoryBroker`] topic.
pub struct MemorySource {
    broker: MemoryBroker,
    topic: String,
    replay_pending: AtomicBool,
}

impl EventSource for MemorySource {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn ensure_group(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.broker
                .inner
                .topics
                .lock()
                .await
                .entry(self.topic.clone())
                .or_default();
            Ok(())
        })
    }

    fn poll(&self, max: usize, timeout: Duration) -> BoxFuture<'_, Vec<BrokerMessage>> {
        Box::pin(async move {
            let inner = &self.broker.inner;
            if Inner::take_failure(&inner.fail_polls) {
                return Err(SyncError::broker_msg("XREADGROUP", "injected poll failure"));
            }

            let max = max.max(1);
            let deadline = tokio::time::Instant::now() + timeout;

            loop {
                let notified = inner.notify.notified();
                {
                    let mut topics = inner.topics.lock().await;
                    let log = topics.entry(self.topic.clone()).or_default();

                    if self.replay_pending.load(Ordering::SeqCst) {
                        let batch = MemoryBroker::take_batch(log, &self.topic, max, true);
                        if !batch.is_empty() {
                            // One pass over what was pending at startup.
                            self.replay_pending.store(false, Ordering::SeqCst);
                            return Ok(batch);
                        }
                        self.replay_pending.store(false, Ordering::SeqCst);
                    }

                    let batch = MemoryBroker::take_batch(log, &self.topic, max, false);
                    if !batch.is_empty() {
                        return Ok(batch);
                    }
                }

                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return Ok(Vec::new());
                }
            }
        })
    }

    fn commit(&self, message: &BrokerMessage) -> BoxFuture<'_, ()> {
        let id = message.id.clone();
        Box::pin(async move {
            let mut topics = self.broker.inner.topics.lock().await;
            let log = topics.entry(self.topic.clone()).or_default();
            if let Some(index) = log.entries.iter().position(|(entry_id, _)| *entry_id == id) {
                if log.pending.remove(&index) {
                    log.committed += 1;
                }
            }
            Ok(())
        })
    }

    fn dead_letter(&self, message: &BrokerMessage, reason: &str) -> BoxFuture<'_, ()> {
        let message = message.clone();
        let reason = reason.to_string();
        Box::pin(async move {
            let inner = &self.broker.inner;
            if inner.fail_dead_letters.load(Ordering::SeqCst) {
                return Err(SyncError::broker_msg(
                    "XADD dead-letter",
                    "injected dead-letter failure",
                ));
            }
            let id = inner.next_id();
            inner
                .topics
                .lock()
                .await
                .entry(self.topic.clone())
                .or_default()
                .dead_letters
                .push(DeadLetter {
                    id,
                    payload: message.payload,
                    reason,
                    source_id: message.id,
                });
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "article-events";

    #[tokio::test]
    async fn test_poll_then_commit() {
        let broker = MemoryBroker::new();
        broker.publish_raw(TOPIC, "a").await;
        broker.publish_raw(TOPIC, "b").await;

        let source = broker.source(TOPIC);
        let batch = source.poll(10, Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].payload, b"a".to_vec());
        assert_eq!(broker.pending_count(TOPIC).await, 2);

        source.commit(&batch[0]).await.unwrap();
        assert_eq!(broker.pending_count(TOPIC).await, 1);
        assert_eq!(broker.committed_count(TOPIC).await, 1);
    }

    #[tokio::test]
    async fn test_poll_respects_max() {
        let broker = MemoryBroker::new();
        for i in 0..5 {
            broker.publish_raw(TOPIC, format!("{}", i)).await;
        }
        let source = broker.source(TOPIC);
        assert_eq!(source.poll(2, Duration::ZERO).await.unwrap().len(), 2);
        assert_eq!(source.poll(2, Duration::ZERO).await.unwrap().len(), 2);
        assert_eq!(source.poll(2, Duration::ZERO).await.unwrap().len(), 1);
        assert!(source.poll(2, Duration::ZERO).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_new_source_redelivers_pending() {
        let broker = MemoryBroker::new();
        broker.publish_raw(TOPIC, "a").await;
        broker.publish_raw(TOPIC, "b").await;

        let first = broker.source(TOPIC);
        let batch = first.poll(10, Duration::ZERO).await.unwrap();
        first.commit(&batch[0]).await.unwrap();
        drop(first);

        let second = broker.source(TOPIC);
        let redelivered = second.poll(10, Duration::ZERO).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].payload, b"b".to_vec());
    }

    #[tokio::test]
    async fn test_poll_wakes_on_publish() {
        let broker = MemoryBroker::new();
        let source = broker.source(TOPIC);

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish_raw(TOPIC, "late").await;
        });

        let batch = source.poll(10, Duration::from_secs(5)).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_poll_times_out_empty() {
        let broker = MemoryBroker::new();
        let source = broker.source(TOPIC);
        let batch = source.poll(10, Duration::from_millis(10)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let broker = MemoryBroker::new();
        broker.fail_next_sends(1);
        assert!(broker.send(TOPIC, b"x".to_vec()).await.is_err());
        assert!(broker.send(TOPIC, b"x".to_vec()).await.is_ok());

        let source = broker.source(TOPIC);
        broker.fail_next_polls(1);
        assert!(source.poll(1, Duration::ZERO).await.is_err());
        assert_eq!(source.poll(1, Duration::ZERO).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dead_letter() {
        let broker = MemoryBroker::new();
        broker.publish_raw(TOPIC, "poison").await;
        let source = broker.source(TOPIC);
        let batch = source.poll(1, Duration::ZERO).await.unwrap();

        source.dead_letter(&batch[0], "bad json").await.unwrap();
        let parked = broker.dead_letters(TOPIC).await;
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].reason, "bad json");
        assert_eq!(parked[0].source_id, batch[0].id);

        broker.fail_dead_letters(true);
        assert!(source.dead_letter(&batch[0], "again").await.is_err());
    }
}
