// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.
//!
//! Provides helpers to spin up a Redis broker for integration tests.

use redis::AsyncCommands;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

/// Create a vanilla Redis container (streams-compatible).
///
/// Uses official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// A Redis broker in a container, plus raw stream helpers.
pub struct TestBroker<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub redis_url: String,
}

impl<'a> TestBroker<'a> {
    pub fn new(docker: &'a Cli) -> Self {
        let container = redis_container(docker);
        let redis_url = redis_url(&container);
        Self {
            container,
            redis_url,
        }
    }

    async fn conn(&self) -> redis::RedisResult<redis::aio::MultiplexedConnection> {
        let client = redis::Client::open(self.redis_url.as_str())?;
        client.get_multiplexed_async_connection().await
    }

    /// Append raw bytes to `topic`, bypassing the producer.
    pub async fn add_raw_event(&self, topic: &str, payload: &[u8]) -> redis::RedisResult<String> {
        let mut conn = self.conn().await?;
        conn.xadd(topic, "*", &[("payload", payload)]).await
    }

    pub async fn stream_len(&self, topic: &str) -> redis::RedisResult<usize> {
        let mut conn = self.conn().await?;
        conn.xlen(topic).await
    }

    /// Drop `group` from `topic`, keeping the stream.
    pub async fn destroy_group(&self, topic: &str, group: &str) -> redis::RedisResult<bool> {
        let mut conn = self.conn().await?;
        redis::cmd("XGROUP")
            .arg("DESTROY")
            .arg(topic)
            .arg(group)
            .query_async(&mut conn)
            .await
    }

    /// Entries delivered to `group` but not yet acknowledged.
    pub async fn pending_count(&self, topic: &str, group: &str) -> redis::RedisResult<usize> {
        let mut conn = self.conn().await?;
        let reply: redis::streams::StreamPendingReply = conn.xpending(topic, group).await?;
        Ok(reply.count())
    }
}
