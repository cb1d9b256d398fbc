//! Recording TargetStore for testing.
//!
//! Wraps a [`MemoryStore`] and records every call for assertions. Uses the
//! trait's default (non-transactional) `apply`, so a failing ledger write
//! after a successful data write can be simulated.

use article_sync::store::{LedgerEntry, MemoryStore, TargetStore};
use article_sync::{ArticlePayload, BoxFuture, SyncError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// A recorded store call.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    Upsert(i64),
    Delete(i64),
    IsProcessed(String),
    MarkProcessed(String),
}

/// TargetStore that records calls and can be told to fail.
///
/// # Example
/// ```rust,ignore
/// let store = RecordingStore::new();
/// store.fail_after(2);           // third data write fails
/// store.fail_mark_processed(true); // ledger writes fail
///
/// // Use in tests...
///
/// assert_eq!(store.upserts().await, vec![1, 2]);
/// ```
pub struct RecordingStore {
    inner: MemoryStore,
    calls: RwLock<Vec<StoreCall>>,
    /// Data writes allowed before failures start.
    fail_after_writes: AtomicUsize,
    write_count: AtomicUsize,
    fail_mark: AtomicBool,
    fail_is_processed: AtomicBool,
    healthy: AtomicBool,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            calls: RwLock::new(Vec::new()),
            fail_after_writes: AtomicUsize::new(usize::MAX),
            write_count: AtomicUsize::new(0),
            fail_mark: AtomicBool::new(false),
            fail_is_processed: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
        }
    }

    /// Fail data writes after `n` successful ones.
    pub fn fail_after(&self, n: usize) {
        self.fail_after_writes.store(n, Ordering::SeqCst);
    }

    /// Let data writes succeed again.
    pub fn heal(&self) {
        self.fail_after_writes.store(usize::MAX, Ordering::SeqCst);
    }

    /// Make ledger writes fail.
    pub fn fail_mark_processed(&self, fail: bool) {
        self.fail_mark.store(fail, Ordering::SeqCst);
    }

    /// Make ledger lookups fail.
    pub fn fail_is_processed(&self, fail: bool) {
        self.fail_is_processed.store(fail, Ordering::SeqCst);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// The wrapped store, for reading back state.
    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    pub async fn calls(&self) -> Vec<StoreCall> {
        self.calls.read().await.clone()
    }

    /// Ids passed to `upsert_article`, in order.
    pub async fn upserts(&self) -> Vec<i64> {
        self.calls
            .read()
            .await
            .iter()
            .filter_map(|c| match c {
                StoreCall::Upsert(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    /// Ids passed to `delete_article`, in order.
    pub async fn deletes(&self) -> Vec<i64> {
        self.calls
            .read()
            .await
            .iter()
            .filter_map(|c| match c {
                StoreCall::Delete(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    pub async fn reset(&self) {
        self.calls.write().await.clear();
        self.write_count.store(0, Ordering::SeqCst);
    }

    async fn record(&self, call: StoreCall) {
        self.calls.write().await.push(call);
    }

    fn check_write(&self) -> Result<(), SyncError> {
        let n = self.write_count.fetch_add(1, Ordering::SeqCst);
        if n >= self.fail_after_writes.load(Ordering::SeqCst) {
            return Err(SyncError::StoreConnect("simulated write failure".to_string()));
        }
        Ok(())
    }
}

impl Default for RecordingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetStore for RecordingStore {
    fn upsert_article(&self, article: ArticlePayload) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.record(StoreCall::Upsert(article.id)).await;
            self.check_write()?;
            self.inner.upsert_article(article).await
        })
    }

    fn delete_article(&self, id: i64) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            self.record(StoreCall::Delete(id)).await;
            self.check_write()?;
            self.inner.delete_article(id).await
        })
    }

    fn is_processed(&self, event_id: &str) -> BoxFuture<'_, bool> {
        let event_id = event_id.to_string();
        Box::pin(async move {
            self.record(StoreCall::IsProcessed(event_id.clone())).await;
            if self.fail_is_processed.load(Ordering::SeqCst) {
                return Err(SyncError::StoreConnect("simulated ledger read failure".to_string()));
            }
            self.inner.is_processed(&event_id).await
        })
    }

    fn mark_processed(&self, entry: LedgerEntry) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            self.record(StoreCall::MarkProcessed(entry.event_id.clone())).await;
            if self.fail_mark.load(Ordering::SeqCst) {
                return Err(SyncError::StoreConnect("simulated ledger write failure".to_string()));
            }
            self.inner.mark_processed(entry).await
        })
    }

    fn health_check(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move { Ok(self.healthy.load(Ordering::SeqCst)) })
    }
}
