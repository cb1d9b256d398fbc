// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis Streams broker adapter.
//!
//! A topic is a stream key; each envelope is one entry with a single
//! `payload` field. Consumers share a consumer group, so entries are spread
//! across the processes of a scaled-out deployment and each entry is owned
//! by one consumer until it is acknowledged.
//!
//! # Commands
//!
//! ```text
//! startup   XGROUP CREATE <topic> <group> 0 MKSTREAM      (BUSYGROUP is fine)
//! poll      XREADGROUP GROUP <group> <consumer> COUNT n [BLOCK ms] STREAMS <topic> <id>
//! claim     XAUTOCLAIM <topic> <group> <consumer> <min-idle-ms> <cursor> COUNT n
//! commit    XACK <topic> <group> <id>
//! park      XADD <topic>.dlq * payload <bytes> reason <text> source_id <id>
//! publish   XADD <topic> * payload <bytes>
//! ```
//!
//! # Pending Replay
//!
//! Entries delivered but never acknowledged (the process died mid-apply)
//! stay in the group's pending list under the name of the consumer that
//! read them. A poll walks three phases:
//!
//! ```text
//! own pending   XREADGROUP ... 0, then the last id seen, until empty
//! claim         XAUTOCLAIM from 0-0 until the cursor wraps to 0-0
//! new           XREADGROUP ... >
//! ```
//!
//! The claim phase moves entries idle for at least `claim_min_idle` from
//! any consumer (a crashed process, or this one under an older name) to
//! this consumer and hands them out like any other batch. It runs at
//! startup and again every `claim_interval`.
//!
//! A `NOGROUP` reply in any phase recreates the group and polls again.

use crate::broker::{BrokerMessage, EventSink, EventSource};
use crate::config::{BrokerConfig, ConsumerConfig};
use crate::error::{BoxFuture, Result, SyncError};
use crate::resilience::{retry_with_backoff, RetryConfig};
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

/// Stream entry field carrying the envelope.
pub const PAYLOAD_FIELD: &str = "payload";

/// Open a connection manager with bounded retry.
///
/// An unparseable URL fails immediately; connection errors and timeouts
/// are retried under `retry`.
pub async fn connect(url: &str, retry: &RetryConfig) -> Result<ConnectionManager> {
    info!(url = %crate::config::redact_url(url), "Connecting to broker");

    let client = Client::open(url)
        .map_err(|e| SyncError::Config(format!("Invalid broker URL: {}", e)))?;

    let result = retry_with_backoff("broker_connect", retry, |_| {
        let client = client.clone();
        async move {
            client
                .get_connection_manager()
                .await
                .map_err(|e| SyncError::broker("CONNECT", e))
        }
    })
    .await;

    crate::metrics::record_connection("broker", result.is_ok());
    if result.is_ok() {
        info!("Connected to broker");
    }
    result
}

/// Extract a bytes field from a stream entry.
fn get_bytes_field(fields: &HashMap<String, redis::Value>, name: &str) -> Option<Vec<u8>> {
    match fields.get(name)? {
        redis::Value::BulkString(bytes) => Some(bytes.clone()),
        redis::Value::SimpleString(s) => Some(s.as_bytes().to_vec()),
        _ => None,
    }
}

/// Flatten an XREADGROUP reply into messages.
///
/// An entry without a usable `payload` field (trimmed while pending, or
/// written by something else) becomes a message with an empty payload; it
/// fails decoding downstream and is committed like any poison message.
fn messages_from_reply(topic: &str, reply: StreamReadReply) -> Vec<BrokerMessage> {
    let mut messages = Vec::new();
    for stream_key in reply.keys {
        for entry in stream_key.ids {
            let payload = get_bytes_field(&entry.map, PAYLOAD_FIELD).unwrap_or_else(|| {
                warn!(message_id = %entry.id, "Stream entry has no payload field");
                Vec::new()
            });
            messages.push(BrokerMessage {
                id: entry.id,
                topic: topic.to_string(),
                payload,
            });
        }
    }
    messages
}

/// Start of the pending list for XAUTOCLAIM; also its "done" cursor.
const CLAIM_START: &str = "0-0";

/// `retry` with each attempt bounded by the broker's connect timeout.
fn connect_retry(broker: &BrokerConfig, retry: &RetryConfig) -> RetryConfig {
    RetryConfig {
        connection_timeout: broker.connect_timeout_duration(),
        ..retry.clone()
    }
}

fn is_missing_group(err: &SyncError) -> bool {
    matches!(
        err,
        SyncError::Broker { source: Some(e), .. } if e.code() == Some("NOGROUP")
    )
}

fn value_to_string(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::BulkString(bytes) => String::from_utf8(bytes.clone()).ok(),
        redis::Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

/// Field/value pairs of one entry, flat (RESP2) or as a map (RESP3).
fn entry_fields(value: &redis::Value) -> Option<HashMap<String, redis::Value>> {
    let mut fields = HashMap::new();
    match value {
        redis::Value::Array(flat) => {
            for pair in flat.chunks(2) {
                let [name, field] = pair else { return None };
                fields.insert(value_to_string(name)?, field.clone());
            }
        }
        redis::Value::Map(pairs) => {
            for (name, field) in pairs {
                fields.insert(value_to_string(name)?, field.clone());
            }
        }
        _ => return None,
    }
    Some(fields)
}

/// Parse an XAUTOCLAIM reply into the next cursor and the claimed messages.
///
/// Redis 7 replies `[cursor, entries, deleted-ids]`; 6.2 omits the third
/// element. A nil entry is skipped. An entry whose fields are gone gets an
/// empty payload and is rejected downstream like any poison message.
fn parse_autoclaim_reply(topic: &str, reply: redis::Value) -> Result<(String, Vec<BrokerMessage>)> {
    let malformed = || SyncError::broker_msg("XAUTOCLAIM", "unexpected reply shape");

    let redis::Value::Array(parts) = reply else {
        return Err(malformed());
    };
    let next = parts.first().and_then(value_to_string).ok_or_else(malformed)?;
    let entries = match parts.get(1) {
        Some(redis::Value::Array(entries)) => entries,
        _ => return Err(malformed()),
    };

    let mut messages = Vec::with_capacity(entries.len());
    for entry in entries {
        let redis::Value::Array(parts) = entry else {
            continue;
        };
        let (Some(id), Some(raw_fields)) = (parts.first().and_then(value_to_string), parts.get(1))
        else {
            return Err(malformed());
        };
        let payload = entry_fields(raw_fields)
            .and_then(|fields| get_bytes_field(&fields, PAYLOAD_FIELD))
            .unwrap_or_else(|| {
                warn!(message_id = %id, "Claimed entry has no payload field");
                Vec::new()
            });
        messages.push(BrokerMessage {
            id,
            topic: topic.to_string(),
            payload,
        });
    }
    Ok((next, messages))
}

/// Which part of the stream the next poll reads.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReadPhase {
    /// Replaying this consumer's own pending entries after this id.
    OwnPending(String),
    /// Claiming idle entries of the whole group from this cursor.
    Claim(String),
    /// Reading entries never delivered to the group.
    New,
}

#[derive(Debug)]
struct ReadState {
    phase: ReadPhase,
    last_sweep: Instant,
}

/// Consumer-group reader on one stream.
pub struct RedisEventSource {
    conn: ConnectionManager,
    topic: String,
    dead_letter_topic: String,
    group: String,
    consumer: String,
    claim_min_idle: Duration,
    claim_interval: Duration,
    read: Mutex<ReadState>,
}

impl RedisEventSource {
    pub fn new(conn: ConnectionManager, broker: &BrokerConfig, consumer: &ConsumerConfig) -> Self {
        Self {
            conn,
            topic: broker.topic.clone(),
            dead_letter_topic: broker.dead_letter_topic(),
            group: consumer.group.clone(),
            consumer: consumer.consumer_name.clone(),
            claim_min_idle: consumer.claim_min_idle_duration(),
            claim_interval: consumer.claim_interval_duration(),
            read: Mutex::new(ReadState {
                phase: ReadPhase::OwnPending("0".to_string()),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Connect with bounded retry and build the source.
    pub async fn connect(
        broker: &BrokerConfig,
        consumer: &ConsumerConfig,
        retry: &RetryConfig,
    ) -> Result<Self> {
        let conn = connect(&broker.url, &connect_retry(broker, retry)).await?;
        Ok(Self::new(conn, broker, consumer))
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer
    }

    async fn read_group(&self, id: &str, max: usize, block: Option<Duration>) -> Result<Vec<BrokerMessage>> {
        let mut opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(max.max(1));
        if let Some(block) = block {
            // BLOCK 0 means forever.
            opts = opts.block((block.as_millis() as usize).max(1));
        }

        let mut conn = self.conn.clone();
        let reply: StreamReadReply = conn
            .xread_options(&[&self.topic], &[id], &opts)
            .await
            .map_err(|e| SyncError::broker("XREADGROUP", e))?;

        Ok(messages_from_reply(&self.topic, reply))
    }

    async fn auto_claim(&self, cursor: &str, max: usize) -> Result<(String, Vec<BrokerMessage>)> {
        let mut conn = self.conn.clone();
        let reply: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.topic)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(self.claim_min_idle.as_millis() as u64)
            .arg(cursor)
            .arg("COUNT")
            .arg(max.max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| SyncError::broker("XAUTOCLAIM", e))?;
        parse_autoclaim_reply(&self.topic, reply)
    }

    /// One poll through the read phases. `NOGROUP` is left to the caller.
    async fn read_next(&self, max: usize, timeout: Duration) -> Result<Vec<BrokerMessage>> {
        let mut read = self.read.lock().await;
        if read.phase == ReadPhase::New && read.last_sweep.elapsed() >= self.claim_interval {
            read.phase = ReadPhase::Claim(CLAIM_START.to_string());
        }

        if let ReadPhase::OwnPending(cursor) = read.phase.clone() {
            let messages = self.read_group(&cursor, max, None).await?;
            if let Some(last) = messages.last() {
                debug!(topic = %self.topic, count = messages.len(), "Replaying pending entries");
                read.phase = ReadPhase::OwnPending(last.id.clone());
                return Ok(messages);
            }
            if cursor != "0" {
                info!(topic = %self.topic, "Own pending entries replayed");
            }
            read.phase = ReadPhase::Claim(CLAIM_START.to_string());
        }

        if let ReadPhase::Claim(cursor) = read.phase.clone() {
            let (next, messages) = self.auto_claim(&cursor, max).await?;
            if next == CLAIM_START {
                read.phase = ReadPhase::New;
                read.last_sweep = Instant::now();
            } else {
                read.phase = ReadPhase::Claim(next);
            }
            if !messages.is_empty() {
                info!(
                    topic = %self.topic,
                    count = messages.len(),
                    min_idle_ms = self.claim_min_idle.as_millis() as u64,
                    "Claimed idle pending entries"
                );
                return Ok(messages);
            }
            if read.phase != ReadPhase::New {
                return Ok(Vec::new());
            }
        }
        drop(read);

        let messages = self.read_group(">", max, Some(timeout)).await?;
        if !messages.is_empty() {
            trace!(
                topic = %self.topic,
                count = messages.len(),
                first_id = %messages.first().map(|m| m.id.as_str()).unwrap_or(""),
                last_id = %messages.last().map(|m| m.id.as_str()).unwrap_or(""),
                "Read entries"
            );
        }
        Ok(messages)
    }
}

impl EventSource for RedisEventSource {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn ensure_group(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let result: redis::RedisResult<()> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(&self.topic)
                .arg(&self.group)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;

            match result {
                Ok(()) => {
                    info!(topic = %self.topic, group = %self.group, "Created consumer group");
                    Ok(())
                }
                Err(e) if e.code() == Some("BUSYGROUP") => {
                    debug!(topic = %self.topic, group = %self.group, "Consumer group already exists");
                    Ok(())
                }
                Err(e) => Err(SyncError::broker("XGROUP CREATE", e)),
            }
        })
    }

    fn poll(&self, max: usize, timeout: Duration) -> BoxFuture<'_, Vec<BrokerMessage>> {
        Box::pin(async move {
            match self.read_next(max, timeout).await {
                Err(e) if is_missing_group(&e) => {
                    // Stream or group vanished (Redis restarted without persistence).
                    warn!(topic = %self.topic, group = %self.group, "Consumer group missing, recreating");
                    self.ensure_group().await?;
                    let mut read = self.read.lock().await;
                    read.phase = ReadPhase::New;
                    read.last_sweep = Instant::now();
                    Ok(Vec::new())
                }
                other => other,
            }
        })
    }

    fn commit(&self, message: &BrokerMessage) -> BoxFuture<'_, ()> {
        let id = message.id.clone();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let acked: i64 = conn
                .xack(&self.topic, &self.group, &[&id])
                .await
                .map_err(|e| SyncError::broker("XACK", e))?;
            if acked == 0 {
                debug!(message_id = %id, "XACK matched no pending entry");
            }
            Ok(())
        })
    }

    fn dead_letter(&self, message: &BrokerMessage, reason: &str) -> BoxFuture<'_, ()> {
        let id = message.id.clone();
        let payload = message.payload.clone();
        let reason = reason.to_string();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let fields: [(&str, &[u8]); 3] = [
                (PAYLOAD_FIELD, payload.as_slice()),
                ("reason", reason.as_bytes()),
                ("source_id", id.as_bytes()),
            ];
            let dlq_id: String = conn
                .xadd(&self.dead_letter_topic, "*", &fields)
                .await
                .map_err(|e| SyncError::broker("XADD dead-letter", e))?;
            info!(
                message_id = %id,
                dead_letter_id = %dlq_id,
                dead_letter_topic = %self.dead_letter_topic,
                "Parked message on dead-letter topic"
            );
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            info!(topic = %self.topic, consumer = %self.consumer, "Closing broker subscription");
            Ok(())
        })
    }
}

/// Stream appender for the producer.
#[derive(Clone)]
pub struct RedisEventSink {
    conn: ConnectionManager,
}

impl RedisEventSink {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Connect with bounded retry and build the sink.
    pub async fn connect(broker: &BrokerConfig, retry: &RetryConfig) -> Result<Self> {
        Ok(Self::new(connect(&broker.url, &connect_retry(broker, retry)).await?))
    }
}

impl EventSink for RedisEventSink {
    fn send(&self, topic: &str, payload: Vec<u8>) -> BoxFuture<'_, String> {
        let topic = topic.to_string();
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let id: String = conn
                .xadd(&topic, "*", &[(PAYLOAD_FIELD, payload.as_slice())])
                .await
                .map_err(|e| SyncError::broker("XADD", e))?;
            Ok(id)
        })
    }
}
