// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed destination store.
//!
//! Every bucket lives in one `objects` table keyed by `(bucket, key)`. A
//! batch is a single transaction: preconditions are checked row by row
//! inside it and any failure rolls the whole thing back.
//!
//! # SQLite Busy Handling
//!
//! SQLite can return SQLITE_BUSY/SQLITE_LOCKED when the database is
//! contended (e.g. two streams committing at once, or an external reader
//! holding the WAL). We retry with exponential backoff up to
//! `SQLITE_RETRY_MAX_ATTEMPTS` times, then report the store as
//! `Unavailable` so the consumer backs off. The transaction is re-run from
//! the start on every attempt, so a retry never sees half a batch.

use super::{BatchAction, BatchOp, BoxFuture, KvStore, Record};
use crate::error::StoreError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // Primary result code lives in the low byte of extended codes
            // (SQLITE_BUSY = 5, SQLITE_LOCKED = 6, SQLITE_BUSY_SNAPSHOT = 517).
            if let Some(code) = db_err.code().and_then(|c| c.parse::<i32>().ok()) {
                if matches!(code & 0xff, 5 | 6) {
                    return true;
                }
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
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
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
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
                crate::metrics::record_store_retry("sqlite", operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

fn unavailable(operation: &str, e: sqlx::Error) -> StoreError {
    StoreError::unavailable(operation, e.to_string())
}

/// Destination store backed by a local SQLite database.
pub struct SqliteStore {
    pool: SqlitePool,
    path: String,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Opening SQLite destination store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| StoreError::unavailable("open", format!("invalid SQLite path: {e}")))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| unavailable("open", e))?;

        Self::init(pool, path_str).await
    }

    /// Private in-memory database. A single connection that is never
    /// recycled, since each SQLite memory connection is its own database.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::unavailable("open", e.to_string()))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| unavailable("open", e))?;

        Self::init(pool, ":memory:".to_string()).await
    }

    async fn init(pool: SqlitePool, path: String) -> Result<Self, StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS objects (
                bucket TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                etag TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (bucket, key)
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| unavailable("init", e))?;

        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Number of records in a bucket.
    pub async fn count(&self, bucket: &str) -> Result<u64, StoreError> {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM objects WHERE bucket = ?")
            .bind(bucket)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| unavailable("count", e))?;
        Ok(n.max(0) as u64)
    }

    /// Checkpoint the WAL and close the pool.
    async fn checkpoint_and_close(&self) -> Result<(), StoreError> {
        let pool = &self.pool;
        if let Err(e) = execute_with_retry("wal_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await
        {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!(path = %self.path, "SQLite destination store closed");
        Ok(())
    }

    async fn fetch(&self, bucket: String, key: String) -> Result<Option<Record>, StoreError> {
        let pool = &self.pool;
        let row: Option<(String, String)> = execute_with_retry("get", || async {
            sqlx::query_as("SELECT value, etag FROM objects WHERE bucket = ? AND key = ?")
                .bind(&bucket)
                .bind(&key)
                .fetch_optional(pool)
                .await
        })
        .await
        .map_err(|e| unavailable("get", e))?;

        row.map(|(value, etag)| {
            serde_json::from_str(&value)
                .map(|value| Record { value, etag })
                .map_err(|e| StoreError::Corrupt {
                    bucket: bucket.clone(),
                    key: key.clone(),
                    message: e.to_string(),
                })
        })
        .transpose()
    }

    /// One attempt at the batch transaction. A failed precondition is an
    /// `Ok(Err(..))` so the busy-retry wrapper leaves it alone.
    async fn try_batch(&self, ops: &[BatchOp]) -> Result<Result<(), StoreError>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let now = chrono::Utc::now().timestamp_millis();

        for op in ops {
            let current: Option<(String,)> =
                sqlx::query_as("SELECT etag FROM objects WHERE bucket = ? AND key = ?")
                    .bind(&op.bucket)
                    .bind(&op.key)
                    .fetch_optional(&mut *tx)
                    .await?;

            if !op.precondition.holds(current.as_ref().map(|(etag,)| etag.as_str())) {
                tx.rollback().await?;
                return Ok(Err(op.precondition_failed()));
            }

            match &op.action {
                BatchAction::Put(value) => {
                    let record = Record::new(value.clone());
                    sqlx::query(
                        r#"
                        INSERT INTO objects (bucket, key, value, etag, updated_at)
                        VALUES (?, ?, ?, ?, ?)
                        ON CONFLICT(bucket, key) DO UPDATE SET
                            value = excluded.value,
                            etag = excluded.etag,
                            updated_at = excluded.updated_at
                        "#,
                    )
                    .bind(&op.bucket)
                    .bind(&op.key)
                    .bind(record.value.to_string())
                    .bind(&record.etag)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                }
                BatchAction::Delete => {
                    sqlx::query("DELETE FROM objects WHERE bucket = ? AND key = ?")
                        .bind(&op.bucket)
                        .bind(&op.key)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(Ok(()))
    }

    async fn apply(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        execute_with_retry("put_batch", || self.try_batch(&ops))
            .await
            .map_err(|e| unavailable("put_batch", e))?
    }
}

impl KvStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn get(&self, bucket: &str, key: &str) -> BoxFuture<'_, Option<Record>> {
        Box::pin(self.fetch(bucket.to_string(), key.to_string()))
    }

    fn put_batch(&self, ops: Vec<BatchOp>) -> BoxFuture<'_, ()> {
        Box::pin(self.apply(ops))
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.checkpoint_and_close())
    }
}
