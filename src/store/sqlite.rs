// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL target store (SQLite via sqlx).
//!
//! Holds the replicated `articles` table and the `processed_events` dedup
//! ledger. Both are created on connect if absent.
//!
//! # Atomic Apply
//!
//! [`SqliteStore`] overrides [`TargetStore::apply`] so the data write and the
//! ledger insert commit together:
//!
//! ```text
//! BEGIN
//!   INSERT INTO articles ... ON CONFLICT(id) DO UPDATE   (or DELETE)
//!   INSERT INTO processed_events ... ON CONFLICT DO NOTHING
//!   -- 0 rows: another consumer got there first → ROLLBACK, AlreadyApplied
//! COMMIT
//! ```
//!
//! A crash between the two writes is impossible, and a failed statement
//! rolls back the whole apply; a payload is never partially written.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended (several consumer processes sharing one file). Every statement
//! and every apply transaction is retried with capped exponential backoff.
//!
//! # Timestamps
//!
//! Payload timestamps are stored as RFC 3339 text. An absent timestamp is
//! stored as NULL, never defaulted to the wall clock, so applying the same
//! payload always produces the same row.

use crate::config::StoreConfig;
use crate::error::{BoxFuture, Result, SyncError};
use crate::event::{parse_timestamp, ArticlePayload, ArticleStatus, EventType};
use crate::resilience::{retry_with_backoff, RetryConfig};
use crate::store::{ApplyOutcome, LedgerEntry, Mutation, TargetStore};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteSynchronous,
};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts, "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::store_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts, "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

fn format_ts(ts: &Option<DateTime<Utc>>) -> Option<String> {
    ts.as_ref()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

fn parse_ts(column: &str, raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.map(|s| {
        parse_timestamp(&s)
            .map_err(|e| SyncError::Internal(format!("corrupt {} `{}`: {}", column, s, e)))
    })
    .transpose()
}

/// Bind-ready article columns.
struct ArticleColumns<'a> {
    article: &'a ArticlePayload,
    tags: String,
    created_at: Option<String>,
    updated_at: Option<String>,
    published_at: Option<String>,
}

impl<'a> ArticleColumns<'a> {
    fn new(article: &'a ArticlePayload) -> Result<Self> {
        let tags = serde_json::to_string(&article.tags)
            .map_err(|e| SyncError::Internal(format!("failed to encode tags: {}", e)))?;
        Ok(Self {
            article,
            tags,
            created_at: format_ts(&article.created_at),
            updated_at: format_ts(&article.updated_at),
            published_at: format_ts(&article.published_at),
        })
    }
}

async fn upsert_in(
    conn: &mut SqliteConnection,
    cols: &ArticleColumns<'_>,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO articles (
            id, title, content, author, category, tags, status,
            views_count, created_at, updated_at, published_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            title = excluded.title,
            content = excluded.content,
            author = excluded.author,
            category = excluded.category,
            tags = excluded.tags,
            status = excluded.status,
            views_count = excluded.views_count,
            created_at = excluded.created_at,
            updated_at = excluded.updated_at,
            published_at = excluded.published_at
        "#,
    )
    .bind(cols.article.id)
    .bind(&cols.article.title)
    .bind(&cols.article.content)
    .bind(&cols.article.author)
    .bind(&cols.article.category)
    .bind(&cols.tags)
    .bind(cols.article.status.as_str())
    .bind(cols.article.views_count)
    .bind(&cols.created_at)
    .bind(&cols.updated_at)
    .bind(&cols.published_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn delete_in(conn: &mut SqliteConnection, id: i64) -> std::result::Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM articles WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Bind-ready ledger columns.
struct LedgerColumns<'a> {
    entry: &'a LedgerEntry,
    processed_at: String,
    raw_event: String,
}

impl<'a> LedgerColumns<'a> {
    fn new(entry: &'a LedgerEntry) -> Result<Self> {
        let raw_event = serde_json::to_string(&entry.raw_event)
            .map_err(|e| SyncError::Internal(format!("failed to encode raw event: {}", e)))?;
        Ok(Self {
            entry,
            processed_at: entry
                .processed_at
                .to_rfc3339_opts(SecondsFormat::Micros, true),
            raw_event,
        })
    }
}

/// Returns `false` when the event id was already in the ledger.
async fn insert_ledger_in(
    conn: &mut SqliteConnection,
    cols: &LedgerColumns<'_>,
) -> std::result::Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO processed_events (event_id, event_type, article_id, processed_at, raw_event)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(event_id) DO NOTHING
        "#,
    )
    .bind(&cols.entry.event_id)
    .bind(cols.entry.event_type.as_str())
    .bind(cols.entry.article_id)
    .bind(&cols.processed_at)
    .bind(&cols.raw_event)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

type ArticleRow = (
    i64,
    String,
    String,
    String,
    String,
    String,
    String,
    i64,
    Option<String>,
    Option<String>,
    Option<String>,
);

/// SQLite-backed target store.
pub struct SqliteStore {
    pool: SqlitePool,
    /// Redacted connection URL (for diagnostics).
    url: String,
    wal_mode: bool,
}

impl SqliteStore {
    /// Connect once and create the schema.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let url = config.redacted_url();
        info!(url = %url, "Connecting to target store");

        let memory = is_memory_url(&config.url);
        let wal_mode = config.wal_mode && !memory;

        let mut options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| SyncError::Config(format!("Invalid target store URL: {}", e)))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        if wal_mode {
            options = options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
        }

        // Every connection to `:memory:` is its own database; pin exactly one.
        let pool_options = if memory {
            SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| SyncError::StoreConnect(format!("{}: {}", url, e)))?;

        let store = Self {
            pool,
            url,
            wal_mode,
        };
        store.init_schema().await?;
        info!(url = %store.url, "Target store ready");
        Ok(store)
    }

    /// Connect with bounded exponential backoff.
    pub async fn connect_with_retry(config: &StoreConfig, retry: &RetryConfig) -> Result<Self> {
        let result = retry_with_backoff("store_connect", retry, |_| Self::connect(config)).await;
        crate::metrics::record_connection("store", result.is_ok());
        result
    }

    /// In-memory store (for testing).
    pub async fn in_memory() -> Result<Self> {
        Self::connect(&StoreConfig::in_memory()).await
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                id INTEGER PRIMARY KEY,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                author TEXT NOT NULL,
                category TEXT NOT NULL DEFAULT 'general',
                tags TEXT NOT NULL DEFAULT '[]',
                status TEXT NOT NULL DEFAULT 'draft',
                views_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT,
                updated_at TEXT,
                published_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processed_events (
                event_id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                article_id INTEGER NOT NULL,
                processed_at TEXT NOT NULL,
                raw_event TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_processed_events_article ON processed_events (article_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Read back a replicated article.
    pub async fn fetch_article(&self, id: i64) -> Result<Option<ArticlePayload>> {
        let row: Option<ArticleRow> = sqlx::query_as(
            r#"
            SELECT id, title, content, author, category, tags, status,
                   views_count, created_at, updated_at, published_at
            FROM articles WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((
            id,
            title,
            content,
            author,
            category,
            tags,
            status,
            views_count,
            created_at,
            updated_at,
            published_at,
        )) = row
        else {
            return Ok(None);
        };

        Ok(Some(ArticlePayload {
            id,
            title,
            content,
            author,
            category,
            tags: serde_json::from_str(&tags)
                .map_err(|e| SyncError::Internal(format!("corrupt tags for {}: {}", id, e)))?,
            status: ArticleStatus::from_str(&status).map_err(SyncError::Internal)?,
            views_count,
            created_at: parse_ts("created_at", created_at)?,
            updated_at: parse_ts("updated_at", updated_at)?,
            published_at: parse_ts("published_at", published_at)?,
        }))
    }

    /// Number of replicated articles.
    pub async fn article_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM articles")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Read back a ledger entry.
    pub async fn ledger_entry(&self, event_id: &str) -> Result<Option<LedgerEntry>> {
        let row: Option<(String, String, i64, String, String)> = sqlx::query_as(
            r#"
            SELECT event_id, event_type, article_id, processed_at, raw_event
            FROM processed_events WHERE event_id = ?
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((event_id, event_type, article_id, processed_at, raw_event)) = row else {
            return Ok(None);
        };

        let event_type = EventType::parse(&event_type).ok_or_else(|| {
            SyncError::Internal(format!("corrupt ledger event_type `{}`", event_type))
        })?;
        let processed_at = parse_ts("processed_at", Some(processed_at))?
            .ok_or_else(|| SyncError::Internal("missing processed_at".to_string()))?;
        let raw_event = serde_json::from_str(&raw_event)
            .map_err(|e| SyncError::Internal(format!("corrupt raw_event: {}", e)))?;

        Ok(Some(LedgerEntry {
            event_id,
            event_type,
            article_id,
            processed_at,
            raw_event,
        }))
    }

    /// Number of ledger entries.
    pub async fn ledger_len(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM processed_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Redacted connection URL (for diagnostics).
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Checkpoint WAL and close the pool.
    pub async fn close(&self) {
        if self.wal_mode {
            if let Err(e) = self.checkpoint().await {
                warn!(error = %e, "Failed to checkpoint WAL on close");
            }
        }
        self.pool.close().await;
        info!(url = %self.url, "Target store closed");
    }
}

impl TargetStore for SqliteStore {
    fn upsert_article(&self, article: ArticlePayload) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let cols = ArticleColumns::new(&article)?;
            let pool = &self.pool;
            execute_with_retry("upsert_article", || async {
                let mut conn = pool.acquire().await?;
                upsert_in(&mut conn, &cols).await
            })
            .await?;
            Ok(())
        })
    }

    fn delete_article(&self, id: i64) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let pool = &self.pool;
            let deleted = execute_with_retry("delete_article", || async {
                let mut conn = pool.acquire().await?;
                delete_in(&mut conn, id).await
            })
            .await?;
            Ok(deleted)
        })
    }

    fn is_processed(&self, event_id: &str) -> BoxFuture<'_, bool> {
        let event_id = event_id.to_string();
        Box::pin(async move {
            let pool = &self.pool;
            let found: Option<i64> = execute_with_retry("is_processed", || async {
                sqlx::query_scalar("SELECT 1 FROM processed_events WHERE event_id = ? LIMIT 1")
                    .bind(&event_id)
                    .fetch_optional(pool)
                    .await
            })
            .await?;
            Ok(found.is_some())
        })
    }

    fn mark_processed(&self, entry: LedgerEntry) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let cols = LedgerColumns::new(&entry)?;
            let pool = &self.pool;
            let inserted = execute_with_retry("mark_processed", || async {
                let mut conn = pool.acquire().await?;
                insert_ledger_in(&mut conn, &cols).await
            })
            .await?;
            Ok(inserted)
        })
    }

    fn health_check(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            match sqlx::query_scalar::<_, i64>("SELECT 1")
                .fetch_one(&self.pool)
                .await
            {
                Ok(_) => Ok(true),
                Err(e) => {
                    warn!(url = %self.url, error = %e, "Target store health check failed");
                    Ok(false)
                }
            }
        })
    }

    fn apply(&self, mutation: Mutation, entry: LedgerEntry) -> BoxFuture<'_, ApplyOutcome> {
        Box::pin(async move {
            let article_cols = match &mutation {
                Mutation::Upsert(article) => Some(ArticleColumns::new(article)?),
                Mutation::Delete(_) => None,
            };
            let ledger_cols = LedgerColumns::new(&entry)?;
            let pool = &self.pool;

            let outcome = execute_with_retry("apply", || async {
                let mut tx = pool.begin().await?;

                let data_outcome = match (&mutation, &article_cols) {
                    (Mutation::Upsert(_), Some(cols)) => {
                        upsert_in(&mut tx, cols).await?;
                        ApplyOutcome::Applied
                    }
                    (Mutation::Delete(id), _) => {
                        if delete_in(&mut tx, *id).await? {
                            ApplyOutcome::Applied
                        } else {
                            ApplyOutcome::AlreadyAbsent
                        }
                    }
                    (Mutation::Upsert(_), None) => {
                        return Err(sqlx::Error::Protocol(
                            "upsert without encoded columns".to_string(),
                        ))
                    }
                };

                if !insert_ledger_in(&mut tx, &ledger_cols).await? {
                    tx.rollback().await?;
                    return Ok(ApplyOutcome::AlreadyApplied);
                }

                tx.commit().await?;
                Ok(data_outcome)
            })
            .await?;

            Ok(outcome)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventEnvelope;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn article(id: i64, title: &str) -> ArticlePayload {
        let mut a = ArticlePayload::new(id, title, "body", "ann");
        a.tags = vec!["rust".to_string(), "sync".to_string()];
        a.status = ArticleStatus::Published;
        a.views_count = 3;
        a.created_at = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        a.published_at = Some(Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap());
        a
    }

    fn entry_for(event_type: EventType, article: &ArticlePayload, ts: &str) -> LedgerEntry {
        LedgerEntry::for_event(&EventEnvelope::with_timestamp(
            event_type,
            ts,
            article.clone(),
        ))
    }

    #[tokio::test]
    async fn test_upsert_and_fetch() {
        let store = SqliteStore::in_memory().await.unwrap();
        let a = article(1, "First");
        store.upsert_article(a.clone()).await.unwrap();

        let fetched = store.fetch_article(1).await.unwrap().unwrap();
        assert_eq!(fetched, a);
        assert_eq!(store.article_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upsert_overwrites_every_column() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_article(article(1, "First")).await.unwrap();

        let replacement = ArticlePayload::new(1, "Second", "new body", "bob");
        store.upsert_article(replacement.clone()).await.unwrap();

        let fetched = store.fetch_article(1).await.unwrap().unwrap();
        assert_eq!(fetched, replacement);
        assert!(fetched.published_at.is_none());
        assert!(fetched.tags.is_empty());
        assert_eq!(store.article_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_present_and_absent() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.upsert_article(article(5, "x")).await.unwrap();

        assert!(store.delete_article(5).await.unwrap());
        assert!(!store.delete_article(5).await.unwrap());
        assert!(store.fetch_article(5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_processed_is_append_only() {
        let store = SqliteStore::in_memory().await.unwrap();
        let a = article(1, "x");
        let entry = entry_for(EventType::Created, &a, "2024-01-01T00:00:00Z");

        assert!(!store.is_processed(&entry.event_id).await.unwrap());
        assert!(store.mark_processed(entry.clone()).await.unwrap());
        assert!(store.is_processed(&entry.event_id).await.unwrap());

        let mut again = entry.clone();
        again.raw_event = serde_json::json!({"changed": true});
        assert!(!store.mark_processed(again).await.unwrap());

        let stored = store.ledger_entry(&entry.event_id).await.unwrap().unwrap();
        assert_eq!(stored.raw_event, entry.raw_event);
        assert_eq!(stored.event_type, EventType::Created);
        assert_eq!(stored.article_id, 1);
        assert_eq!(store.ledger_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_apply_is_atomic_and_idempotent() {
        let store = SqliteStore::in_memory().await.unwrap();
        let a = article(42, "T");
        let entry = entry_for(EventType::Created, &a, "2024-01-01T00:00:00Z");

        let first = store
            .apply(Mutation::Upsert(a.clone()), entry.clone())
            .await
            .unwrap();
        assert_eq!(first, ApplyOutcome::Applied);

        // Same event again, with a different payload: the ledger wins and
        // the row is left untouched.
        let tampered = ArticlePayload::new(42, "other", "other", "other");
        let second = store
            .apply(Mutation::Upsert(tampered), entry.clone())
            .await
            .unwrap();
        assert_eq!(second, ApplyOutcome::AlreadyApplied);

        assert_eq!(store.fetch_article(42).await.unwrap().unwrap(), a);
        assert_eq!(store.ledger_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_apply_delete_absent_records_ledger() {
        let store = SqliteStore::in_memory().await.unwrap();
        let a = ArticlePayload::new(9, "T", "C", "A");
        let entry = entry_for(EventType::Deleted, &a, "2024-01-01T00:00:00Z");

        let outcome = store
            .apply(Mutation::Delete(9), entry.clone())
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::AlreadyAbsent);
        assert!(store.is_processed(&entry.event_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_health_check() {
        let store = SqliteStore::in_memory().await.unwrap();
        assert!(store.health_check().await.unwrap());
        store.close().await;
        assert!(!store.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::sqlite_file(dir.path().join("replica.db"));
        let a = article(3, "durable");
        let entry = entry_for(EventType::Updated, &a, "2024-02-02T00:00:00Z");

        {
            let store = SqliteStore::connect(&config).await.unwrap();
            store.apply(Mutation::Upsert(a.clone()), entry.clone()).await.unwrap();
            store.close().await;
        }

        {
            let store = SqliteStore::connect(&config).await.unwrap();
            assert_eq!(store.fetch_article(3).await.unwrap().unwrap(), a);
            assert!(store.is_processed(&entry.event_id).await.unwrap());
            store.close().await;
        }
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        let config = StoreConfig {
            url: "sqlite://replica.db?mode=bogus".to_string(),
            ..Default::default()
        };
        let result = SqliteStore::connect(&config).await;
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[tokio::test]
    async fn test_connect_with_retry_gives_up() {
        let dir = tempdir().unwrap();
        // A directory that does not exist cannot hold the database file.
        let config = StoreConfig::sqlite_file(dir.path().join("missing").join("replica.db"));
        let result = SqliteStore::connect_with_retry(&config, &RetryConfig::testing()).await;
        assert!(matches!(result, Err(SyncError::StoreConnect(_))));
    }

    #[tokio::test]
    async fn test_execute_with_retry_succeeds_immediately() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Ok(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count, 1);
    }

    #[tokio::test]
    async fn test_execute_with_retry_fails_on_non_busy_error() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempt_count, 1);
    }

    #[test]
    fn test_is_sqlite_busy_error_non_database() {
        assert!(!is_sqlite_busy_error(&sqlx::Error::RowNotFound));
        assert!(!is_sqlite_busy_error(&sqlx::Error::PoolTimedOut));
    }

    #[test]
    fn test_is_memory_url() {
        assert!(is_memory_url("sqlite::memory:"));
        assert!(is_memory_url("sqlite://file?mode=memory&cache=shared"));
        assert!(!is_memory_url("sqlite://replica.db?mode=rwc"));
    }
}
