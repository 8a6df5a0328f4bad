//! Watermark cache.
//!
//! One SQLite database per namespace records, for every processed entry,
//! the last address or folder path the reconciler produced and the entry's
//! modification time. The highest modification time ever recorded is kept
//! separately so the resume point never moves backwards, even after
//! records are removed.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::{debug, instrument};

use crate::error::{WatermarkError, WatermarkResult};

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS entries (
        entry_id TEXT PRIMARY KEY NOT NULL,
        result_address TEXT,
        modified_ms INTEGER
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS high_water (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        modified_ms INTEGER NOT NULL
    )
    ",
];

/// What the cache remembers about one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatermarkRecord {
    pub entry_id: String,
    /// Primary address of a user, or folder path of a shared folder.
    pub result_address: Option<String>,
    pub modified: Option<DateTime<Utc>>,
}

impl WatermarkRecord {
    pub fn new(entry_id: impl Into<String>) -> Self {
        Self {
            entry_id: entry_id.into(),
            result_address: None,
            modified: None,
        }
    }

    #[must_use]
    pub fn with_result_address(mut self, address: impl Into<String>) -> Self {
        self.result_address = Some(address.into());
        self
    }

    #[must_use]
    pub fn with_modified(mut self, modified: Option<DateTime<Utc>>) -> Self {
        self.modified = modified;
        self
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WatermarkRow {
    entry_id: String,
    result_address: Option<String>,
    modified_ms: Option<i64>,
}

impl WatermarkRow {
    fn into_record(self) -> WatermarkRecord {
        WatermarkRecord {
            entry_id: self.entry_id,
            result_address: self.result_address,
            modified: self.modified_ms.and_then(DateTime::from_timestamp_millis),
        }
    }
}

/// Per-namespace persistent cache.
#[derive(Debug, Clone)]
pub struct WatermarkCache {
    pool: SqlitePool,
    namespace: String,
}

impl WatermarkCache {
    /// Open (creating if needed) the cache for `namespace` under `cache_dir`.
    pub async fn open(cache_dir: &Path, namespace: &str) -> WatermarkResult<Self> {
        tokio::fs::create_dir_all(cache_dir)
            .await
            .map_err(|source| WatermarkError::Io {
                path: cache_dir.to_path_buf(),
                source,
            })?;

        let path = Self::database_path(cache_dir, namespace);
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        debug!(namespace, path = %path.display(), "Opened watermark cache");
        Self::with_pool(pool, namespace).await
    }

    /// Volatile cache that lives as long as its single connection.
    pub async fn in_memory(namespace: &str) -> WatermarkResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::with_pool(pool, namespace).await
    }

    async fn with_pool(pool: SqlitePool, namespace: &str) -> WatermarkResult<Self> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self {
            pool,
            namespace: namespace.to_string(),
        })
    }

    /// Database file for a namespace.
    #[must_use]
    pub fn database_path(cache_dir: &Path, namespace: &str) -> PathBuf {
        cache_dir.join(format!("{}.db", sanitize(namespace)))
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Record for an entry.
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn get(&self, entry_id: &str) -> WatermarkResult<Option<WatermarkRecord>> {
        let row = sqlx::query_as::<_, WatermarkRow>(
            r"
            SELECT entry_id, result_address, modified_ms
            FROM entries
            WHERE entry_id = ?1
            ",
        )
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(WatermarkRow::into_record))
    }

    /// Insert or replace a record and raise the high-water mark.
    #[instrument(skip(self, record), fields(namespace = %self.namespace, entry_id = %record.entry_id))]
    pub async fn upsert(&self, record: &WatermarkRecord) -> WatermarkResult<()> {
        let modified_ms = record.modified.map(|m| m.timestamp_millis());
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r"
            INSERT INTO entries (entry_id, result_address, modified_ms)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (entry_id) DO UPDATE SET
                result_address = excluded.result_address,
                modified_ms = excluded.modified_ms
            ",
        )
        .bind(&record.entry_id)
        .bind(&record.result_address)
        .bind(modified_ms)
        .execute(&mut *tx)
        .await?;

        if let Some(modified_ms) = modified_ms {
            sqlx::query(
                r"
                INSERT INTO high_water (id, modified_ms)
                VALUES (1, ?1)
                ON CONFLICT (id) DO UPDATE SET
                    modified_ms = MAX(high_water.modified_ms, excluded.modified_ms)
                ",
            )
            .bind(modified_ms)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Remove a record. Returns whether one existed.
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn remove(&self, entry_id: &str) -> WatermarkResult<bool> {
        let result = sqlx::query("DELETE FROM entries WHERE entry_id = ?1")
            .bind(entry_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Highest modification time ever recorded; the feed resumes from here.
    pub async fn resume_from(&self) -> WatermarkResult<Option<DateTime<Utc>>> {
        let high_water: Option<i64> =
            sqlx::query_scalar("SELECT modified_ms FROM high_water WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        let newest: Option<i64> = sqlx::query_scalar("SELECT MAX(modified_ms) FROM entries")
            .fetch_one(&self.pool)
            .await?;

        Ok(high_water
            .max(newest)
            .and_then(DateTime::from_timestamp_millis))
    }

    /// Number of records.
    pub async fn len(&self) -> WatermarkResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Check if no records are stored.
    pub async fn is_empty(&self) -> WatermarkResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Close the pool, flushing pending writes.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// File-name-safe form of a namespace.
fn sanitize(namespace: &str) -> String {
    namespace
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c.to_ascii_lowercase(),
        })
        .collect()
}
