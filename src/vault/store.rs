//! Key-value backing stores for session records.
//!
//! Both stores are last-write-wins: concurrent `put`s to the same key simply
//! overwrite each other.

use crate::error::AppResult;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use sqlx::{Pool, Sqlite};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Minimal key-value contract the session vault relies on.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a live (unexpired) value.
    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    /// Insert or overwrite a value that expires after `ttl_secs`.
    async fn put(&self, key: &str, value: String, ttl_secs: u64) -> AppResult<()>;

    /// Remove a value. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> AppResult<()>;
}

#[derive(Clone, Debug)]
struct StoredValue {
    value: String,
    expires_at: Instant,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// In-process store with lazy TTL eviction.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, StoredValue>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, including ones that expired but were not read since.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(None);
        };
        if entry.is_expired() {
            drop(entry);
            self.entries.remove(key);
            return Ok(None);
        }
        Ok(Some(entry.value.clone()))
    }

    async fn put(&self, key: &str, value: String, ttl_secs: u64) -> AppResult<()> {
        self.entries.insert(
            key.to_string(),
            StoredValue {
                value,
                expires_at: Instant::now() + Duration::from_secs(ttl_secs),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}

pub type DbPool = Pool<Sqlite>;

/// SQLite-backed store shared by every server process pointing at the same file.
#[derive(Debug, Clone)]
pub struct SqliteKvStore {
    pool: DbPool,
}

impl SqliteKvStore {
    /// Wrap a pool and make sure the table exists.
    pub async fn init(pool: DbPool) -> AppResult<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT NOT NULL,
                expires_at_ms INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_kv_entries_expiry ON kv_entries (expires_at_ms)")
            .execute(&pool)
            .await?;

        info!("Session store initialized");
        Ok(Self { pool })
    }

    /// Delete every expired row. Returns the number removed.
    pub async fn purge_expired(&self) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM kv_entries WHERE expires_at_ms <= ?")
            .bind(Utc::now().timestamp_millis())
            .execute(&self.pool)
            .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            debug!(removed, "Purged expired session records");
        }
        Ok(removed)
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let value = sqlx::query_scalar::<_, String>(
            "SELECT value FROM kv_entries WHERE key = ? AND expires_at_ms > ?",
        )
        .bind(key)
        .bind(Utc::now().timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        Ok(value)
    }

    async fn put(&self, key: &str, value: String, ttl_secs: u64) -> AppResult<()> {
        let expires_at_ms = Utc::now().timestamp_millis() + (ttl_secs as i64) * 1000;
        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, expires_at_ms)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                expires_at_ms = excluded.expires_at_ms
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(expires_at_ms)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM kv_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
