//! In-process target store.
//!
//! Keeps articles and the ledger in memory behind one lock, so `apply` is
//! atomic like the SQL store's transaction. Used for standalone runs
//! (`sqlite::memory:` would do as well, minus the SQL) and throughout the
//! test suite.

use crate::error::BoxFuture;
use crate::event::ArticlePayload;
use crate::store::{ApplyOutcome, LedgerEntry, Mutation, TargetStore};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::trace;

#[derive(Default)]
struct Tables {
    articles: HashMap<i64, ArticlePayload>,
    ledger: HashMap<String, LedgerEntry>,
}

/// In-memory replica plus ledger.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read back a replicated article.
    pub async fn fetch_article(&self, id: i64) -> Option<ArticlePayload> {
        self.tables.read().await.articles.get(&id).cloned()
    }

    /// Number of replicated articles.
    pub async fn article_count(&self) -> usize {
        self.tables.read().await.articles.len()
    }

    /// Read back a ledger entry.
    pub async fn ledger_entry(&self, event_id: &str) -> Option<LedgerEntry> {
        self.tables.read().await.ledger.get(event_id).cloned()
    }

    /// Number of ledger entries.
    pub async fn ledger_len(&self) -> usize {
        self.tables.read().await.ledger.len()
    }
}

impl TargetStore for MemoryStore {
    fn upsert_article(&self, article: ArticlePayload) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            trace!(article_id = article.id, "Memory: upsert");
            self.tables.write().await.articles.insert(article.id, article);
            Ok(())
        })
    }

    fn delete_article(&self, id: i64) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            trace!(article_id = id, "Memory: delete");
            Ok(self.tables.write().await.articles.remove(&id).is_some())
        })
    }

    fn is_processed(&self, event_id: &str) -> BoxFuture<'_, bool> {
        let event_id = event_id.to_string();
        Box::pin(async move { Ok(self.tables.read().await.ledger.contains_key(&event_id)) })
    }

    fn mark_processed(&self, entry: LedgerEntry) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let mut tables = self.tables.write().await;
            if tables.ledger.contains_key(&entry.event_id) {
                return Ok(false);
            }
            tables.ledger.insert(entry.event_id.clone(), entry);
            Ok(true)
        })
    }

    fn health_check(&self) -> BoxFuture<'_, bool> {
        Box::pin(async { Ok(true) })
    }

    fn apply(&self, mutation: Mutation, entry: LedgerEntry) -> BoxFuture<'_, ApplyOutcome> {
        Box::pin(async move {
            let mut tables = self.tables.write().await;
            if tables.ledger.contains_key(&entry.event_id) {
                return Ok(ApplyOutcome::AlreadyApplied);
            }

            let outcome = match mutation {
                Mutation::Upsert(article) => {
                    tables.articles.insert(article.id, article);
                    ApplyOutcome::Applied
                }
                Mutation::Delete(id) => {
                    if tables.articles.remove(&id).is_some() {
                        ApplyOutcome::Applied
                    } else {
                        ApplyOutcome::AlreadyAbsent
                    }
                }
            };
            tables.ledger.insert(entry.event_id.clone(), entry);
            Ok(outcome)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventEnvelope, EventType};

    fn entry(event_type: EventType, id: i64, ts: &str) -> LedgerEntry {
        LedgerEntry::for_event(&EventEnvelope::with_timestamp(
            event_type,
            ts,
            ArticlePayload::new(id, "T", "C", "A"),
        ))
    }

    #[tokio::test]
    async fn test_apply_upsert_then_duplicate() {
        let store = MemoryStore::new();
        let article = ArticlePayload::new(1, "T", "C", "A");
        let e = entry(EventType::Created, 1, "t1");

        assert_eq!(
            store.apply(Mutation::Upsert(article.clone()), e.clone()).await.unwrap(),
            ApplyOutcome::Applied
        );
        assert_eq!(
            store
                .apply(Mutation::Upsert(ArticlePayload::new(1, "X", "X", "X")), e)
                .await
                .unwrap(),
            ApplyOutcome::AlreadyApplied
        );
        assert_eq!(store.fetch_article(1).await, Some(article));
        assert_eq!(store.ledger_len().await, 1);
    }

    #[tokio::test]
    async fn test_apply_delete_absent() {
        let store = MemoryStore::new();
        let outcome = store
            .apply(Mutation::Delete(5), entry(EventType::Deleted, 5, "t1"))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::AlreadyAbsent);
        assert_eq!(store.ledger_len().await, 1);
    }

    #[tokio::test]
    async fn test_primitives() {
        let store = MemoryStore::new();
        store
            .upsert_article(ArticlePayload::new(2, "T", "C", "A"))
            .await
            .unwrap();
        assert_eq!(store.article_count().await, 1);
        assert!(store.delete_article(2).await.unwrap());
        assert!(!store.delete_article(2).await.unwrap());

        let e = entry(EventType::Updated, 2, "t2");
        assert!(!store.is_processed(&e.event_id).await.unwrap());
        assert!(store.mark_processed(e.clone()).await.unwrap());
        assert!(!store.mark_processed(e.clone()).await.unwrap());
        assert!(store.is_processed(&e.event_id).await.unwrap());
        assert!(store.ledger_entry(&e.event_id).await.is_some());
        assert!(store.health_check().await.unwrap());
    }
}
