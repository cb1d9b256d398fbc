//! At-least-once event publishing.
//!
//! Called by the primary write path after its own commit succeeds. The
//! envelope is serialized once and sent with a bounded exponential backoff:
//!
//! ```text
//! attempt 1 ──fail──▶ sleep 1s ──▶ attempt 2 ──fail──▶ sleep 2s ──▶ attempt 3 ──fail──▶ Publish error
//! ```
//!
//! Exhausting the budget is reported to the caller, whose write is not
//! rolled back. The replica may then miss that update until the next
//! change to the same article.

use crate::broker::EventSink;
use crate::config::ProducerConfig;
use crate::error::{Result, SyncError};
use crate::event::{ArticlePayload, EventEnvelope, EventError, EventType};
use crate::metrics;
use crate::resilience::{retry_with_backoff, RetryConfig};
use std::time::Instant;
use tracing::{debug, error, instrument};

/// Where a published event landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub topic: String,
    /// Broker-assigned message id.
    pub message_id: String,
    /// Attempts it took, including the successful one.
    pub attempts: usize,
}

/// Publishes article change events to one topic.
pub struct EventProducer<K: EventSink> {
    sink: K,
    topic: String,
    retry: RetryConfig,
}

impl<K: EventSink> EventProducer<K> {
    pub fn new(sink: K, topic: impl Into<String>, config: &ProducerConfig) -> Self {
        let retry = RetryConfig {
            max_attempts: config.max_attempts.max(1),
            initial_delay: config.initial_backoff_duration(),
            connection_timeout: config.send_timeout_duration(),
            ..RetryConfig::producer()
        };
        Self {
            sink,
            topic: topic.into(),
            retry,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Publish a change event carrying the post-mutation snapshot.
    #[instrument(
        name = "publish_event",
        skip_all,
        fields(event_type = %event_type, article_id = article.id, topic = %self.topic)
    )]
    pub async fn publish(
        &self,
        event_type: EventType,
        article: &ArticlePayload,
    ) -> Result<PublishReceipt> {
        let envelope = EventEnvelope::new(event_type, article.clone());
        self.publish_envelope(&envelope).await
    }

    /// Publish a prebuilt envelope (operator replay keeps its timestamp,
    /// and therefore its fingerprint).
    pub async fn publish_envelope(&self, envelope: &EventEnvelope) -> Result<PublishReceipt> {
        let event_type = envelope.event_type.as_str();
        let payload = envelope
            .encode()
            .map_err(|e| SyncError::InvalidEvent(EventError::Json(e)))?;

        let start = Instant::now();
        let mut attempts = 0;

        let result = retry_with_backoff("publish", &self.retry, |attempt| {
            attempts = attempt;
            if attempt > 1 {
                metrics::record_publish_retry(event_type);
            }
            self.sink.send(&self.topic, payload.clone())
        })
        .await;

        match result {
            Ok(message_id) => {
                metrics::record_publish(event_type, true, attempts, start.elapsed());
                debug!(message_id = %message_id, attempts, "Event published");
                Ok(PublishReceipt {
                    topic: self.topic.clone(),
                    message_id,
                    attempts,
                })
            }
            Err(e) => {
                metrics::record_publish(event_type, false, attempts, start.elapsed());
                error!(
                    event_id = %envelope.event_id(),
                    attempts,
                    error = %e,
                    "Publish failed, replica will miss this update"
                );
                if e.is_retryable() {
                    Err(SyncError::Publish {
                        attempts,
                        message: e.to_string(),
                    })
                } else {
                    Err(e)
                }
            }
        }
    }

    pub async fn publish_created(&self, article: &ArticlePayload) -> Result<PublishReceipt> {
        self.publish(EventType::Created, article).await
    }

    pub async fn publish_updated(&self, article: &ArticlePayload) -> Result<PublishReceipt> {
        self.publish(EventType::Updated, article).await
    }

    pub async fn publish_deleted(&self, article: &ArticlePayload) -> Result<PublishReceipt> {
        self.publish(EventType::Deleted, article).await
    }

    pub async fn publish_published(&self, article: &ArticlePayload) -> Result<PublishReceipt> {
        self.publish(EventType::Published, article).await
    }
}
