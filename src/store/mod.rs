// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Target store integration.
//!
//! Defines what the sync engine needs from the secondary datastore:
//! idempotent article writes plus a durable dedup ledger.
//!
//! # Implementations
//!
//! - [`SqliteStore`]: the SQL replica (sqlx, SQLite). Data write and ledger
//!   write share one transaction.
//! - [`MemoryStore`]: in-process replica for standalone runs and tests.
//!
//! # Example
//!
//! ```rust,no_run
//! use article_sync::store::{TargetStore, LedgerEntry};
//! use article_sync::{ArticlePayload, BoxFuture};
//!
//! struct MyStore;
//!
//! impl TargetStore for MyStore {
//!     fn upsert_article(&self, _article: ArticlePayload) -> BoxFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//!
//!     fn delete_article(&self, _id: i64) -> BoxFuture<'_, bool> {
//!         Box::pin(async { Ok(false) })
//!     }
//!
//!     fn is_processed(&self, _event_id: &str) -> BoxFuture<'_, bool> {
//!         Box::pin(async { Ok(false) })
//!     }
//!
//!     fn mark_processed(&self, _entry: LedgerEntry) -> BoxFuture<'_, bool> {
//!         Box::pin(async { Ok(true) })
//!     }
//!
//!     fn health_check(&self) -> BoxFuture<'_, bool> {
//!         Box::pin(async { Ok(true) })
//!     }
//! }
//! ```

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::BoxFuture;
use crate::event::{ArticlePayload, EventEnvelope, EventType};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::warn;

/// A write against the replicated `articles` table.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Full-payload insert-or-overwrite.
    Upsert(ArticlePayload),
    /// Remove by id. Absence is not an error.
    Delete(i64),
}

impl Mutation {
    /// Mutation an event maps to.
    ///
    /// `created`, `updated` and `published` all carry a full snapshot and
    /// upsert it; `deleted` removes the row.
    pub fn for_event(envelope: &EventEnvelope) -> Self {
        match envelope.event_type {
            EventType::Created | EventType::Updated | EventType::Published => {
                Mutation::Upsert(envelope.data.clone())
            }
            EventType::Deleted => Mutation::Delete(envelope.data.id),
        }
    }

    pub fn article_id(&self) -> i64 {
        match self {
            Mutation::Upsert(article) => article.id,
            Mutation::Delete(id) => *id,
        }
    }
}

/// One row of the dedup ledger. Append-only.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub event_id: String,
    pub event_type: EventType,
    pub article_id: i64,
    pub processed_at: DateTime<Utc>,
    pub raw_event: serde_json::Value,
}

impl LedgerEntry {
    /// Ledger entry for an event, stamped now.
    pub fn for_event(envelope: &EventEnvelope) -> Self {
        Self {
            event_id: envelope.event_id(),
            event_type: envelope.event_type,
            article_id: envelope.article_id(),
            processed_at: Utc::now(),
            raw_event: envelope.raw_event(),
        }
    }
}

/// Result of a successful apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The store changed and the ledger recorded it.
    Applied,
    /// The ledger already held this event; nothing was written.
    AlreadyApplied,
    /// A delete found no row. Recorded in the ledger like any apply.
    AlreadyAbsent,
}

impl ApplyOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Applied => "applied",
            ApplyOutcome::AlreadyApplied => "already_applied",
            ApplyOutcome::AlreadyAbsent => "already_absent",
        }
    }
}

/// What the sync engine needs from the secondary datastore.
///
/// Implementations must make `upsert_article` a full overwrite keyed by id,
/// and `delete_article` succeed when the id is absent. The ledger is
/// append-only: `mark_processed` never updates an existing entry.
pub trait TargetStore: Send + Sync + 'static {
    /// Insert the article, or overwrite every column of the existing row.
    fn upsert_article(&self, article: ArticlePayload) -> BoxFuture<'_, ()>;

    /// Delete by id. Returns `true` if a row was removed.
    fn delete_article(&self, id: i64) -> BoxFuture<'_, bool>;

    /// Whether the ledger holds `event_id`.
    fn is_processed(&self, event_id: &str) -> BoxFuture<'_, bool>;

    /// Append to the ledger. Returns `false` if the entry already existed.
    fn mark_processed(&self, entry: LedgerEntry) -> BoxFuture<'_, bool>;

    /// Cheap liveness probe.
    fn health_check(&self) -> BoxFuture<'_, bool>;

    /// Apply `mutation` and record `entry`.
    ///
    /// The default writes data first, then the ledger, without a shared
    /// transaction. A ledger failure after the data write is a near-miss:
    /// it is logged and counted, and the apply still reports success, since
    /// a later redelivery re-applies the same idempotent write.
    ///
    /// Stores that support transactions override this to make the pair
    /// atomic.
    fn apply(&self, mutation: Mutation, entry: LedgerEntry) -> BoxFuture<'_, ApplyOutcome> {
        Box::pin(async move {
            let outcome = match mutation {
                Mutation::Upsert(article) => {
                    self.upsert_article(article).await?;
                    ApplyOutcome::Applied
                }
                Mutation::Delete(id) => {
                    if self.delete_article(id).await? {
                        ApplyOutcome::Applied
                    } else {
                        ApplyOutcome::AlreadyAbsent
                    }
                }
            };

            let event_id = entry.event_id.clone();
            let article_id = entry.article_id;
            if let Err(e) = self.mark_processed(entry).await {
                warn!(
                    event_id = %event_id,
                    article_id,
                    error = %e,
                    "Ledger write failed after successful apply (near-miss), redelivery will re-apply"
                );
                crate::metrics::record_ledger_near_miss();
            }

            Ok(outcome)
        })
    }
}

impl<T: TargetStore + ?Sized> TargetStore for Arc<T> {
    fn upsert_article(&self, article: ArticlePayload) -> BoxFuture<'_, ()> {
        (**self).upsert_article(article)
    }

    fn delete_article(&self, id: i64) -> BoxFuture<'_, bool> {
        (**self).delete_article(id)
    }

    fn is_processed(&self, event_id: &str) -> BoxFuture<'_, bool> {
        (**self).is_processed(event_id)
    }

    fn mark_processed(&self, entry: LedgerEntry) -> BoxFuture<'_, bool> {
        (**self).mark_processed(entry)
    }

    fn health_check(&self) -> BoxFuture<'_, bool> {
        (**self).health_check()
    }

    fn apply(&self, mutation: Mutation, entry: LedgerEntry) -> BoxFuture<'_, ApplyOutcome> {
        (**self).apply(mutation, entry)
    }
}
