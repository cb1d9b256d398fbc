// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Article change events: envelope, payload and the decode boundary.
//!
//! The wire format is a JSON envelope:
//!
//! ```json
//! {
//!   "event_type": "article.created",
//!   "timestamp": "2024-01-01T00:00:00Z",
//!   "data": { "id": 42, "title": "T", "content": "C", "author": "A" }
//! }
//! ```
//!
//! # Decoding
//!
//! Decoding is strict and fails on the first missing or invalid field, in
//! this order: JSON syntax, `event_type`, `data`, `data.id`, event type
//! name, `timestamp`, then the article payload itself. An envelope that
//! gets past [`EventEnvelope::decode`] is fully typed; nothing downstream
//! has to re-check it.
//!
//! # Fingerprint
//!
//! The idempotency key of an event is the hex SHA-256 of
//! `"<event_type>:<article_id>:<timestamp>"`. The same mutation published
//! twice (producer retry, broker redelivery) always hashes to the same key.

use chrono::{DateTime, Datelike, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Kind of mutation an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "article.created")]
    Created,
    #[serde(rename = "article.updated")]
    Updated,
    #[serde(rename = "article.deleted")]
    Deleted,
    #[serde(rename = "article.published")]
    Published,
}

impl EventType {
    /// All defined event types.
    pub const ALL: [EventType; 4] = [
        EventType::Created,
        EventType::Updated,
        EventType::Deleted,
        EventType::Published,
    ];

    /// Wire name (e.g. `article.created`).
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "article.created",
            EventType::Updated => "article.updated",
            EventType::Deleted => "article.deleted",
            EventType::Published => "article.published",
        }
    }

    /// Parse a wire name. Returns `None` for anything not defined.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publication status of an article.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArticleStatus {
    #[default]
    Draft,
    Published,
    Archived,
}

impl ArticleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArticleStatus::Draft => "draft",
            ArticleStatus::Published => "published",
            ArticleStatus::Archived => "archived",
        }
    }
}

impl FromStr for ArticleStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "draft" => Ok(ArticleStatus::Draft),
            "published" => Ok(ArticleStatus::Published),
            "archived" => Ok(ArticleStatus::Archived),
            other => Err(format!("unknown article status: {}", other)),
        }
    }
}

impl fmt::Display for ArticleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_category() -> String {
    "general".to_string()
}

/// Snapshot of an article as carried in an event.
///
/// Mirrors the primary entity. `id` is the identity; the payload is always
/// a complete snapshot, so applying it is a full overwrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticlePayload {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub author: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub status: ArticleStatus,
    #[serde(default)]
    pub views_count: i64,
    #[serde(default, with = "iso_timestamp")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, with = "iso_timestamp")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, with = "iso_timestamp")]
    pub published_at: Option<DateTime<Utc>>,
}

impl ArticlePayload {
    /// Minimal draft article, handy for tests and demos.
    pub fn new(
        id: i64,
        title: impl Into<String>,
        content: impl Into<String>,
        author: impl Into<String>,
    ) -> Self {
        Self {
            id,
            title: title.into(),
            content: content.into(),
            author: author.into(),
            category: default_category(),
            tags: Vec::new(),
            status: ArticleStatus::Draft,
            views_count: 0,
            created_at: None,
            updated_at: None,
            published_at: None,
        }
    }
}

/// Why a timestamp string was refused.
#[derive(Debug, Error)]
pub enum TimestampError {
    #[error(transparent)]
    Parse(#[from] chrono::ParseError),

    #[error("year {0} is outside 0000..=9999 once normalized to UTC")]
    OutOfRange(i32),
}

/// Parse an ISO-8601 timestamp.
///
/// Accepts RFC 3339 (`2024-01-01T00:00:00Z`, `+02:00` offsets) and naive
/// timestamps without an offset (`2024-01-01T00:00:00.123456`), which are
/// taken as UTC.
///
/// The UTC year must fit in four digits: `9999-12-31T23:59:59-01:00` is
/// refused because it would be written back as `+10000-...`.
pub fn parse_timestamp(s: &str) -> std::result::Result<DateTime<Utc>, TimestampError> {
    let dt = match DateTime::parse_from_rfc3339(s) {
        Ok(dt) => dt.with_timezone(&Utc),
        Err(_) => NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")?.and_utc(),
    };
    if !(0..=9999).contains(&dt.year()) {
        return Err(TimestampError::OutOfRange(dt.year()));
    }
    Ok(dt)
}

/// Format a timestamp the way the producer puts it on the wire.
pub fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

mod iso_timestamp {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(dt) => serializer.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(s) => super::parse_timestamp(s)
                .map(Some)
                .map_err(|e| serde::de::Error::custom(format!("invalid timestamp `{}`: {}", s, e))),
        }
    }
}

/// Why an envelope was rejected at the decode boundary.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("undecodable JSON: {0}")]
    Json(#[source] serde_json::Error),

    #[error("envelope is not a JSON object")]
    NotAnObject,

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("unknown event type `{0}`")]
    UnknownEventType(String),

    #[error("invalid article payload: {0}")]
    InvalidPayload(#[source] serde_json::Error),
}

impl EventError {
    /// Short label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            EventError::Json(_) => "undecodable",
            EventError::NotAnObject => "not_an_object",
            EventError::MissingField(_) => "missing_field",
            EventError::InvalidField { .. } => "invalid_field",
            EventError::UnknownEventType(_) => "unknown_event_type",
            EventError::InvalidPayload(_) => "invalid_payload",
        }
    }
}

#[derive(Serialize)]
struct WireEnvelope<'a> {
    event_type: EventType,
    timestamp: &'a str,
    data: &'a ArticlePayload,
}

/// A decoded, validated change event.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub event_type: EventType,
    pub timestamp: String,
    pub data: ArticlePayload,
    /// The JSON as received, kept verbatim for the ledger.
    raw: Option<Value>,
}

impl EventEnvelope {
    /// Build an envelope stamped with the current time.
    pub fn new(event_type: EventType, data: ArticlePayload) -> Self {
        Self::with_timestamp(event_type, format_timestamp(&Utc::now()), data)
    }

    /// Build an envelope with an explicit timestamp.
    pub fn with_timestamp(
        event_type: EventType,
        timestamp: impl Into<String>,
        data: ArticlePayload,
    ) -> Self {
        Self {
            event_type,
            timestamp: timestamp.into(),
            data,
            raw: None,
        }
    }

    /// Decode and validate an envelope from raw message bytes.
    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, EventError> {
        let value: Value = serde_json::from_slice(bytes).map_err(EventError::Json)?;
        Self::from_value(value)
    }

    /// Validate an already-parsed JSON value.
    pub fn from_value(value: Value) -> std::result::Result<Self, EventError> {
        let obj = value.as_object().ok_or(EventError::NotAnObject)?;

        let event_type_name = match obj.get("event_type") {
            None | Some(Value::Null) => return Err(EventError::MissingField("event_type")),
            Some(Value::String(s)) if s.trim().is_empty() => {
                return Err(EventError::MissingField("event_type"))
            }
            Some(Value::String(s)) => s.trim(),
            Some(_) => {
                return Err(EventError::InvalidField {
                    field: "event_type",
                    reason: "expected a string".to_string(),
                })
            }
        };

        let data = match obj.get("data") {
            None | Some(Value::Null) => return Err(EventError::MissingField("data")),
            Some(Value::Object(map)) if map.is_empty() => {
                return Err(EventError::MissingField("data"))
            }
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(EventError::InvalidField {
                    field: "data",
                    reason: "expected an object".to_string(),
                })
            }
        };

        match data.get("id") {
            None | Some(Value::Null) => return Err(EventError::MissingField("data.id")),
            Some(id) => match id.as_i64() {
                Some(n) if n > 0 => {}
                _ => {
                    return Err(EventError::InvalidField {
                        field: "data.id",
                        reason: format!("expected a positive integer, got {}", id),
                    })
                }
            },
        }

        let event_type = EventType::parse(event_type_name)
            .ok_or_else(|| EventError::UnknownEventType(event_type_name.to_string()))?;

        let timestamp = match obj.get("timestamp") {
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            None | Some(Value::Null) | Some(Value::String(_)) => {
                return Err(EventError::MissingField("timestamp"))
            }
            Some(_) => {
                return Err(EventError::InvalidField {
                    field: "timestamp",
                    reason: "expected an ISO-8601 string".to_string(),
                })
            }
        };

        let payload: ArticlePayload = serde_json::from_value(Value::Object(data.clone()))
            .map_err(EventError::InvalidPayload)?;

        Ok(Self {
            event_type,
            timestamp,
            data: payload,
            raw: Some(value),
        })
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> std::result::Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.wire())
    }

    /// Identity of the article this event is about.
    pub fn article_id(&self) -> i64 {
        self.data.id
    }

    /// Idempotency key of this event.
    pub fn event_id(&self) -> String {
        fingerprint(self.event_type, self.data.id, &self.timestamp)
    }

    /// JSON to record in the ledger: the received document if decoded,
    /// otherwise the canonical encoding.
    pub fn raw_event(&self) -> Value {
        match &self.raw {
            Some(v) => v.clone(),
            None => serde_json::to_value(self.wire()).unwrap_or(Value::Null),
        }
    }

    fn wire(&self) -> WireEnvelope<'_> {
        WireEnvelope {
            event_type: self.event_type,
            timestamp: &self.timestamp,
            data: &self.data,
        }
    }
}

/// Deterministic idempotency key over `(event_type, article_id, timestamp)`.
pub fn fingerprint(event_type: EventType, article_id: i64, timestamp: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event_type.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(article_id.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(timestamp.as_bytes());
    hex::encode(hasher.finalize())
}
