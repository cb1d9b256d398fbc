//! # Article Sync
//!
//! Event-driven replication of article changes from a primary CRUD service
//! into a secondary SQL store.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  publish   ┌──────────────────┐  poll    ┌────────────────────────────┐
//! │ primary CRUD │──────────►│ topic            │────────►│ Consumer (poll loop)       │
//! │ write path   │ (producer) │ (Redis Streams,  │ (group)  │   decode envelope          │
//! └──────────────┘            │  consumer group) │◄────────│   SyncEngine: dedup+apply  │
//!                             └──────────────────┘  commit  │   commit offset            │
//!                                                           └─────────────┬──────────────┘
//!                                                                         │
//!                                                                         ▼
//!                                                           ┌────────────────────────────┐
//!                                                           │ TargetStore (SQLite)       │
//!                                                           │   articles + ledger        │
//!                                                           └────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! - **At-least-once delivery** from the broker; offsets are committed per
//!   message, after the message has been handled.
//! - **Idempotent apply**: every event has a fingerprint over
//!   `(event_type, article_id, timestamp)`; the ledger makes a redelivered
//!   event a no-op.
//! - **Poison isolation**: malformed envelopes are rejected and committed,
//!   never retried.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use article_sync::broker::MemoryBroker;
//! use article_sync::{ArticlePayload, Consumer, EventProducer, MemoryStore, SyncConfig};
//!
//! #[tokio::main]
//! async fn main() -> article_sync::Result<()> {
//!     let config = SyncConfig::for_testing("article-events");
//!     let broker = MemoryBroker::new();
//!
//!     let producer = EventProducer::new(broker.clone(), "article-events", &config.producer);
//!     producer.publish_created(&ArticlePayload::new(42, "T", "C", "A")).await?;
//!
//!     let consumer = Consumer::new(broker.source("article-events"), MemoryStore::new(), config.consumer);
//!     let handle = consumer.shutdown_handle();
//!     tokio::spawn(async move {
//!         tokio::time::sleep(std::time::Duration::from_secs(1)).await;
//!         handle.stop();
//!     });
//!     consumer.start().await
//! }
//! ```

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod event;
pub mod metrics;
pub mod producer;
pub mod resilience;
pub mod store;
pub mod sync;

// Re-exports for convenience
pub use broker::{BrokerMessage, EventSink, EventSource};
pub use config::{BrokerConfig, ConsumerConfig, FailurePolicy, ProducerConfig, StoreConfig, SyncConfig};
pub use consumer::{Consumer, ConsumerState, ConsumerStats, HealthCheck, ShutdownHandle};
pub use error::{BoxFuture, Result, SyncError};
pub use event::{
    fingerprint, ArticlePayload, ArticleStatus, EventEnvelope, EventError, EventType,
    TimestampError,
};
pub use producer::{EventProducer, PublishReceipt};
pub use store::{ApplyOutcome, LedgerEntry, MemoryStore, Mutation, SqliteStore, TargetStore};
pub use sync::SyncEngine;
