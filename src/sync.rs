//! Sync engine: decides whether a decoded event is applied, and how.
//!
//! # Design
//!
//! ```text
//! EventEnvelope ──▶ fingerprint ──▶ is_processed? ──yes──▶ AlreadyApplied
//!                                        │
//!                                        no
//!                                        ▼
//!                         Mutation::for_event (dispatch)
//!                          created/updated/published → Upsert
//!                          deleted                   → Delete
//!                                        │
//!                                        ▼
//!                        TargetStore::apply(mutation, ledger entry)
//! ```
//!
//! The ledger check up front is a fast path; the authoritative dedup is the
//! ledger insert inside `apply`, so two consumers racing on the same event
//! still write it once.
//!
//! Envelope validation (required fields, known event types) happens at the
//! decode boundary in [`crate::event`]; an [`EventEnvelope`] is already
//! well-formed by construction. [`SyncEngine::handle_bytes`] is the entry
//! point that includes decoding.

use crate::error::Result;
use crate::event::EventEnvelope;
use crate::store::{ApplyOutcome, LedgerEntry, Mutation, TargetStore};
use tracing::{debug, instrument};

/// Routing and idempotency over a [`TargetStore`].
pub struct SyncEngine<S: TargetStore> {
    store: S,
}

impl<S: TargetStore> SyncEngine<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Apply one decoded event, at most once.
    ///
    /// Returns `AlreadyApplied` without touching the store when the ledger
    /// already holds the event's fingerprint. Store errors are returned
    /// as-is; nothing is recorded in the ledger for a failed apply.
    #[instrument(
        name = "sync_event",
        skip_all,
        fields(
            event_id = tracing::field::Empty,
            event_type = %envelope.event_type,
            article_id = envelope.article_id(),
        )
    )]
    pub async fn handle_event(&self, envelope: &EventEnvelope) -> Result<ApplyOutcome> {
        let event_id = envelope.event_id();
        tracing::Span::current().record("event_id", event_id.as_str());

        if self.store.is_processed(&event_id).await? {
            debug!("Event already in ledger, skipping");
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        let mutation = Mutation::for_event(envelope);
        let entry = LedgerEntry::for_event(envelope);
        let outcome = self.store.apply(mutation, entry).await?;

        debug!(outcome = outcome.as_str(), "Event handled");
        Ok(outcome)
    }

    /// Decode raw message bytes, then [`handle_event`](Self::handle_event).
    ///
    /// A malformed envelope yields [`SyncError::InvalidEvent`](crate::SyncError::InvalidEvent)
    /// and leaves the store and ledger untouched.
    pub async fn handle_bytes(&self, bytes: &[u8]) -> Result<ApplyOutcome> {
        let envelope = EventEnvelope::decode(bytes)?;
        self.handle_event(&envelope).await
    }
}
