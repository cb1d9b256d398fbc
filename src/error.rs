// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the article sync core.
//!
//! Errors are categorized by their source (broker, target store, decoding)
//! and carry enough context to make the log line useful on its own.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Broker` | Yes | Redis unreachable, command failed, connection dropped |
//! | `Store` | Yes | SQL statement or transaction failed |
//! | `StoreConnect` | Yes | Target store unreachable at startup |
//! | `Timeout` | Yes | A bounded attempt ran out of time |
//! | `InvalidEvent` | No | Malformed envelope (poison message) |
//! | `Publish` | No | Producer retry budget exhausted |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Consumer state machine violation |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! [`SyncError::is_retryable()`] separates transient infrastructure trouble
//! from permanent rejections. The consumer never retries a non-retryable
//! error: a malformed envelope is committed and skipped.

use crate::event::EventError;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Boxed future returned by the adapter traits (store, broker).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Errors that can occur while publishing, consuming or applying events.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Redis connection or command error.
    ///
    /// Network timeouts, connection drops, failed XREADGROUP/XACK/XADD.
    #[error("Broker error ({operation}): {message}")]
    Broker {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// SQL error against the target store.
    ///
    /// The transaction that produced it has been rolled back.
    #[error("Target store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Target store could not be reached.
    #[error("Target store connection error: {0}")]
    StoreConnect(String),

    /// A bounded attempt (connect, send) did not finish in time.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Envelope failed validation at the decode boundary.
    #[error("Invalid event: {0}")]
    InvalidEvent(#[from] EventError),

    /// Producer gave up after exhausting its attempt budget.
    #[error("Publish failed after {attempts} attempts: {message}")]
    Publish { attempts: usize, message: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation attempted in the wrong lifecycle state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Create a broker error from a redis::RedisError
    pub fn broker(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Broker {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a broker error without source
    pub fn broker_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Broker {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Broker { .. } => true,
            Self::Store(_) => true,
            Self::StoreConnect(_) => true,
            Self::Timeout { .. } => true,
            Self::InvalidEvent(_) => false, // Poison message
            Self::Publish { .. } => false,  // Budget already spent
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Internal(_) => false,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Broker { .. } => "broker",
            Self::Store(_) => "store",
            Self::StoreConnect(_) => "store_connect",
            Self::Timeout { .. } => "timeout",
            Self::InvalidEvent(_) => "invalid_event",
            Self::Publish { .. } => "publish",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Internal(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retryable_broker() {
        let err = SyncError::broker_msg("XREADGROUP", "connection reset");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("XREADGROUP"));
    }

    #[test]
    fn test_is_retryable_store() {
        let err = SyncError::Store(sqlx::Error::PoolTimedOut);
        assert!(err.is_retryable());
        assert_eq!(err.kind(), "store");
    }

    #[test]
    fn test_is_retryable_store_connect() {
        let err = SyncError::StoreConnect("refused".to_string());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_is_retryable_timeout() {
        let err = SyncError::Timeout {
            operation: "XADD".to_string(),
            after: Duration::from_secs(10),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("XADD timed out"));
    }

    #[test]
    fn test_not_retryable_invalid_event() {
        let err = SyncError::from(EventError::MissingField("data"));
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("data"));
    }

    #[test]
    fn test_not_retryable_publish() {
        let err = SyncError::Publish {
            attempts: 3,
            message: "timed out".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("3 attempts"));
    }

    #[test]
    fn test_not_retryable_config() {
        let err = SyncError::Config("empty topic".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_retryable_invalid_state() {
        let err = SyncError::InvalidState {
            expected: "Stopped".to_string(),
            actual: "Running".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("Stopped"));
        assert!(err.to_string().contains("Running"));
    }

    #[test]
    fn test_not_retryable_internal() {
        assert!(!SyncError::Internal("bug".to_string()).is_retryable());
    }

    #[test]
    fn test_broker_error_formatting() {
        let err = SyncError::Broker {
            operation: "XACK".to_string(),
            message: "timeout".to_string(),
            source: None,
        };
        let msg = err.to_string();
        assert!(msg.contains("Broker error"));
        assert!(msg.contains("XACK"));
        assert!(msg.contains("timeout"));
    }
}
