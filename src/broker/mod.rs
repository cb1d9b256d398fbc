//! Broker integration traits.
//!
//! The consumer and the producer only see these two seams:
//!
//! - [`EventSource`]: consumer-group side (`poll`, `commit`, `dead_letter`)
//! - [`EventSink`]: producer side (`send`)
//!
//! # Implementations
//!
//! | Adapter | Broker | Use |
//! |---------|--------|-----|
//! | [`RedisEventSource`] / [`RedisEventSink`] | Redis Streams consumer groups | Production |
//! | [`MemoryBroker`] | In-process | Tests, demos |
//!
//! # Delivery
//!
//! At-least-once. A polled message stays pending until committed; a
//! consumer that restarts without committing sees it again.

pub mod memory;
pub mod redis_streams;

pub use memory::{DeadLetter, MemoryBroker, MemorySource};
pub use redis_streams::{RedisEventSink, RedisEventSource};

use crate::error::BoxFuture;
use std::time::Duration;

/// One message read from a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Broker-assigned id (Redis stream entry id, e.g. `1700000000000-0`).
    pub id: String,
    /// Topic the message was read from.
    pub topic: String,
    /// Envelope bytes as published.
    pub payload: Vec<u8>,
}

/// Consumer-group side of the broker.
pub trait EventSource: Send + Sync + 'static {
    /// Topic this source reads.
    fn topic(&self) -> &str;

    /// Create the consumer group if it does not exist yet.
    fn ensure_group(&self) -> BoxFuture<'_, ()>;

    /// Read up to `max` messages, waiting at most `timeout` for the first.
    ///
    /// Messages delivered to this consumer but never committed come back
    /// before new ones. An empty batch means the wait timed out.
    fn poll(&self, max: usize, timeout: Duration) -> BoxFuture<'_, Vec<BrokerMessage>>;

    /// Acknowledge one message. It will not be delivered again.
    fn commit(&self, message: &BrokerMessage) -> BoxFuture<'_, ()>;

    /// Copy a message to the dead-letter topic. Does not commit it.
    fn dead_letter(&self, message: &BrokerMessage, reason: &str) -> BoxFuture<'_, ()>;

    /// Release the subscription.
    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Producer side of the broker.
pub trait EventSink: Send + Sync + 'static {
    /// Append `payload` to `topic`. Returns the broker-assigned message id.
    fn send(&self, topic: &str, payload: Vec<u8>) -> BoxFuture<'_, String>;
}
