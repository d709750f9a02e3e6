//! Durable SQLite-backed mapping from cache digest to descriptor +
//! metadata, generalizing the teacher's `RecoveryIndex`.

use super::manifest::Descriptor;
use crate::digest::Digest;
use crate::error::Result;
use crate::platform::Platform;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// One cache index row: the descriptor pointing at the manifest blob
/// plus bookkeeping metadata used for TTL/LRU eviction decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheIndexEntry {
    pub descriptor: Descriptor,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub operation_hash: String,
    pub platform: Platform,
    pub ttl: Option<i64>,
    pub tags: BTreeMap<String, String>,
}

/// Aggregate counters returned by [`CacheIndex::statistics`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexStatistics {
    pub entry_count: u64,
    pub total_bytes: u64,
}

/// SQLite-backed durable index for the content-addressable cache.
pub struct CacheIndex {
    pool: SqlitePool,
}

impl CacheIndex {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url).await?;
        let index = Self { pool };
        index.initialize_schema().await?;
        Ok(index)
    }

    async fn initialize_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                cache_digest TEXT PRIMARY KEY,
                media_type TEXT NOT NULL,
                size INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                accessed_at INTEGER NOT NULL,
                operation_hash TEXT NOT NULL,
                platform_json TEXT NOT NULL,
                ttl INTEGER,
                tags_json TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS ix_cache_accessed_at ON cache_entries(accessed_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS ix_cache_created_at ON cache_entries(created_at)")
            .execute(&self.pool)
            .await?;

        info!("cache index schema initialized");
        Ok(())
    }

    pub async fn get(&self, cache_digest: &Digest) -> Result<Option<CacheIndexEntry>> {
        let row = sqlx::query("SELECT * FROM cache_entries WHERE cache_digest = ?")
            .bind(cache_digest.to_string_value())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_entry).transpose()
    }

    pub async fn put(&self, cache_digest: &Digest, entry: &CacheIndexEntry) -> Result<()> {
        let platform_json = serde_json::to_string(&entry.platform)?;
        let tags_json = serde_json::to_string(&entry.tags)?;
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO cache_entries
            (cache_digest, media_type, size, created_at, accessed_at, operation_hash, platform_json, ttl, tags_json)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(cache_digest.to_string_value())
        .bind(&entry.descriptor.media_type)
        .bind(entry.descriptor.size as i64)
        .bind(entry.created_at.timestamp())
        .bind(entry.accessed_at.timestamp())
        .bind(&entry.operation_hash)
        .bind(platform_json)
        .bind(entry.ttl)
        .bind(tags_json)
        .execute(&self.pool)
        .await?;
        debug!(cache_digest = %cache_digest, "cache index entry written");
        Ok(())
    }

    pub async fn touch_accessed_at(&self, cache_digest: &Digest, accessed_at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE cache_entries SET accessed_at = ? WHERE cache_digest = ?")
            .bind(accessed_at.timestamp())
            .bind(cache_digest.to_string_value())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn remove(&self, cache_digests: &[Digest]) -> Result<()> {
        for digest in cache_digests {
            sqlx::query("DELETE FROM cache_entries WHERE cache_digest = ?")
                .bind(digest.to_string_value())
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn all_entries(&self) -> Result<Vec<(Digest, CacheIndexEntry)>> {
        let rows = sqlx::query("SELECT * FROM cache_entries").fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let digest_str: String = row.get("cache_digest");
            let digest = Digest::parse(&digest_str)?;
            out.push((digest, Self::row_to_entry(row)?));
        }
        Ok(out)
    }

    pub async fn statistics(&self) -> Result<IndexStatistics> {
        let row = sqlx::query("SELECT COUNT(*) as count, COALESCE(SUM(size), 0) as total FROM cache_entries")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.get("count");
        let total: i64 = row.get("total");
        Ok(IndexStatistics {
            entry_count: count as u64,
            total_bytes: total as u64,
        })
    }

    fn row_to_entry(row: sqlx::sqlite::SqliteRow) -> Result<CacheIndexEntry> {
        let media_type: String = row.get("media_type");
        let size: i64 = row.get("size");
        let created_at: i64 = row.get("created_at");
        let accessed_at: i64 = row.get("accessed_at");
        let operation_hash: String = row.get("operation_hash");
        let platform_json: String = row.get("platform_json");
        let ttl: Option<i64> = row.get("ttl");
        let tags_json: String = row.get("tags_json");
        let digest_str: String = row.get("cache_digest");

        Ok(CacheIndexEntry {
            descriptor: Descriptor {
                media_type,
                digest: Digest::parse(&digest_str)?,
                size: size as u64,
            },
            created_at: DateTime::from_timestamp(created_at, 0).unwrap_or_else(Utc::now),
            accessed_at: DateTime::from_timestamp(accessed_at, 0).unwrap_or_else(Utc::now),
            operation_hash,
            platform: serde_json::from_str(&platform_json)?,
            ttl,
            tags: serde_json::from_str(&tags_json)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_index() -> CacheIndex {
        CacheIndex::new("sqlite::memory:").await.unwrap()
    }

    fn entry(digest: Digest) -> CacheIndexEntry {
        CacheIndexEntry {
            descriptor: Descriptor {
                media_type: "application/vnd.container-build.cache.manifest.v5+json".to_string(),
                digest,
                size: 128,
            },
            created_at: Utc::now(),
            accessed_at: Utc::now(),
            operation_hash: "op-hash".to_string(),
            platform: Platform::new("linux", "amd64"),
            ttl: Some(3600),
            tags: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let index = memory_index().await;
        let digest = Digest::of(b"cache-entry");
        index.put(&digest, &entry(digest)).await.unwrap();
        let fetched = index.get(&digest).await.unwrap().unwrap();
        assert_eq!(fetched.descriptor.digest, digest);
    }

    #[tokio::test]
    async fn remove_deletes_entry() {
        let index = memory_index().await;
        let digest = Digest::of(b"cache-entry");
        index.put(&digest, &entry(digest)).await.unwrap();
        index.remove(&[digest]).await.unwrap();
        assert!(index.get(&digest).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn statistics_reflect_entry_count_and_size() {
        let index = memory_index().await;
        let d1 = Digest::of(b"a");
        let d2 = Digest::of(b"b");
        index.put(&d1, &entry(d1)).await.unwrap();
        index.put(&d2, &entry(d2)).await.unwrap();
        let stats = index.statistics().await.unwrap();
        assert_eq!(stats.entry_count, 2);
        assert_eq!(stats.total_bytes, 256);
    }
}
