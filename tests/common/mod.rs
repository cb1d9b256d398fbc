//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - A recording TargetStore with failure injection
//! - Envelope builders

#![allow(dead_code)]

pub mod containers;
pub mod mock_store;

pub use containers::*;
pub use mock_store::*;

use article_sync::{ArticlePayload, EventEnvelope, EventType};

pub const TOPIC: &str = "article-events";

/// Envelope for article `id` with a fixed timestamp.
pub fn envelope(event_type: EventType, id: i64, title: &str, timestamp: &str) -> EventEnvelope {
    EventEnvelope::with_timestamp(
        event_type,
        timestamp,
        ArticlePayload::new(id, title, "content", "author"),
    )
}

/// Wire bytes of [`envelope`].
pub fn encoded(event_type: EventType, id: i64, title: &str, timestamp: &str) -> Vec<u8> {
    envelope(event_type, id, title, timestamp)
        .encode()
        .expect("envelope encodes")
}

/// Poll `f` every 10ms for up to `secs` seconds.
pub async fn wait_until<F: Fn() -> bool>(secs: u64, f: F) -> bool {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(secs);
    while std::time::Instant::now() < deadline {
        if f() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    f()
}
