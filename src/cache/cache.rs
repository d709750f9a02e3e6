//! Content-addressable cache: `get`/`put`/`has`/`evict`, TTL- and
//! size-bounded eviction, and the background GC task.

use super::index::{CacheIndex, CacheIndexEntry};
use super::manifest::{CacheKey, CacheManifest, CachedResult, Descriptor, MANIFEST_MEDIA_TYPE};
use super::store::ContentStore;
use crate::digest::Digest;
use crate::error::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Eviction strategy name reported by [`CacheStatistics`]. Only `lru`
/// is implemented, per spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EvictionPolicy {
    Lru,
}

impl EvictionPolicy {
    pub fn name(self) -> &'static str {
        match self {
            EvictionPolicy::Lru => "lru",
        }
    }
}

/// Cache tunables, per spec §6's `Configuration` block.
#[derive(Debug, Clone)]
pub struct CacheConfiguration {
    pub max_size: u64,
    pub max_age: Option<Duration>,
    pub index_path: String,
    pub eviction_policy: EvictionPolicy,
    pub concurrency: usize,
    pub verify_integrity: bool,
    pub sharding: Option<u32>,
    pub gc_interval: Duration,
    pub cache_key_version: String,
    pub default_ttl: Option<Duration>,
}

impl Default for CacheConfiguration {
    fn default() -> Self {
        Self {
            max_size: 10 * 1024 * 1024 * 1024,
            max_age: None,
            index_path: "sqlite::memory:".to_string(),
            eviction_policy: EvictionPolicy::Lru,
            concurrency: 4,
            verify_integrity: false,
            sharding: None,
            gc_interval: Duration::from_secs(300),
            cache_key_version: "v1".to_string(),
            default_ttl: None,
        }
    }
}

/// Aggregate stats returned by [`ContentAddressableCache::statistics`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStatistics {
    pub entry_count: u64,
    pub total_bytes: u64,
    pub hit_rate: f64,
    pub avg_entry_size: f64,
    pub policy: &'static str,
}

/// Content-addressable build cache. Generic over the content store so
/// tests can swap in [`super::MemoryContentStore`].
pub struct ContentAddressableCache<S: ContentStore> {
    index: CacheIndex,
    store: Arc<S>,
    config: CacheConfiguration,
    hits: AtomicU64,
    misses: AtomicU64,
    /// Serializes all public cache operations: `get`/`put`/`evict`/GC
    /// each acquire this so a `get` racing an eviction never observes
    /// a half-deleted entry.
    op_lock: Mutex<()>,
}

impl<S: ContentStore> ContentAddressableCache<S> {
    pub async fn new(index: CacheIndex, store: Arc<S>, config: CacheConfiguration) -> Self {
        Self {
            index,
            store,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            op_lock: Mutex::new(()),
        }
    }

    /// Derive the cache digest, look up the index entry, fetch the
    /// manifest blob, and return the reconstructed [`CachedResult`].
    /// Self-heals: a missing or malformed manifest removes the orphan
    /// index entry and returns `None` rather than erroring.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<CachedResult>> {
        let _guard = self.op_lock.lock().await;
        let cache_digest = key.cache_digest(&self.config.cache_key_version);

        let Some(entry) = self.index.get(&cache_digest).await? else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let manifest: Option<CacheManifest> = self.store.get(entry.descriptor.digest).await?;
        let Some(manifest) = manifest else {
            warn!(cache_digest = %cache_digest, "orphan cache index entry, removing");
            self.index.remove(&[cache_digest]).await?;
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        self.index
            .touch_accessed_at(&cache_digest, Utc::now())
            .await?;
        self.hits.fetch_add(1, Ordering::Relaxed);
        Ok(Some(CachedResult::from(&manifest)))
    }

    /// Idempotent: if an entry already exists for `key`, returns
    /// silently. Errors are logged and swallowed — caching must never
    /// break a build.
    pub async fn put(&self, key: &CacheKey, result: CachedResult, operation_type: &str) {
        if let Err(err) = self.try_put(key, result, operation_type).await {
            error!(error = %err, "cache put failed, continuing without caching this result");
        }
    }

    async fn try_put(&self, key: &CacheKey, result: CachedResult, operation_type: &str) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let cache_digest = key.cache_digest(&self.config.cache_key_version);

        if self.index.get(&cache_digest).await?.is_some() {
            return Ok(());
        }

        let manifest = CacheManifest::new(
            key.clone(),
            operation_type,
            env!("CARGO_PKG_VERSION"),
            result.snapshot,
            result.environment_changes,
            result.metadata_changes,
        );

        let session = self.store.new_ingest_session().await?;
        let write_result = self.store.write(session, &manifest).await;
        let (size, digest) = match write_result {
            Ok(v) => v,
            Err(err) => {
                self.store.cancel_ingest_session(session).await.ok();
                return Err(err);
            }
        };
        self.store.complete_ingest_session(session).await?;

        let now = Utc::now();
        let entry = CacheIndexEntry {
            descriptor: Descriptor {
                media_type: MANIFEST_MEDIA_TYPE.to_string(),
                digest,
                size,
            },
            created_at: now,
            accessed_at: now,
            operation_hash: key.operation_digest.to_string_value(),
            platform: key.platform.clone(),
            ttl: self.config.default_ttl.map(|d| d.as_secs() as i64),
            tags: BTreeMap::new(),
        };
        self.index.put(&cache_digest, &entry).await?;

        let total_bytes = self.index.statistics().await?.total_bytes;
        if total_bytes > self.config.max_size {
            let target = (self.config.max_size as f64 * 0.8) as u64;
            if let Err(err) = self.evict_to_target(target).await {
                warn!(error = %err, "post-put eviction failed");
            }
        }
        Ok(())
    }

    pub async fn has(&self, key: &CacheKey) -> Result<bool> {
        let _guard = self.op_lock.lock().await;
        let cache_digest = key.cache_digest(&self.config.cache_key_version);
        Ok(self.index.get(&cache_digest).await?.is_some())
    }

    /// Delete the manifest blob and index entry for each digest.
    pub async fn evict(&self, cache_digests: &[Digest]) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        self.evict_locked(cache_digests).await
    }

    async fn evict_locked(&self, cache_digests: &[Digest]) -> Result<()> {
        let mut blob_digests = Vec::with_capacity(cache_digests.len());
        for cache_digest in cache_digests {
            if let Some(entry) = self.index.get(cache_digest).await? {
                blob_digests.push(entry.descriptor.digest);
            }
        }
        self.store.delete(&blob_digests).await?;
        self.index.remove(cache_digests).await?;
        Ok(())
    }

    async fn evict_to_target(&self, target_bytes: u64) -> Result<()> {
        let mut entries = self.index.all_entries().await?;
        entries.sort_by_key(|(_, entry)| entry.accessed_at);

        let mut total: u64 = entries.iter().map(|(_, e)| e.descriptor.size).sum();
        let mut to_evict = Vec::new();
        for (digest, entry) in entries {
            if total <= target_bytes {
                break;
            }
            total = total.saturating_sub(entry.descriptor.size);
            to_evict.push(digest);
        }
        if !to_evict.is_empty() {
            debug!(count = to_evict.len(), "evicting LRU cache entries over size budget");
            self.evict_locked(&to_evict).await?;
        }
        Ok(())
    }

    /// Periodic GC pass: evict TTL-expired entries, then enforce the
    /// size budget.
    async fn run_gc(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let now = Utc::now();
        let entries = self.index.all_entries().await?;
        let expired: Vec<Digest> = entries
            .iter()
            .filter_map(|(digest, entry)| {
                let ttl = entry.ttl?;
                let expires_at = entry.created_at + chrono::Duration::seconds(ttl);
                (expires_at < now).then_some(*digest)
            })
            .collect();
        if !expired.is_empty() {
            debug!(count = expired.len(), "evicting TTL-expired cache entries");
            self.evict_locked(&expired).await?;
        }
        drop(_guard);

        let total_bytes = self.index.statistics().await?.total_bytes;
        if total_bytes > self.config.max_size {
            let target = (self.config.max_size as f64 * 0.8) as u64;
            self.evict_to_target(target).await?;
        }
        Ok(())
    }

    pub async fn statistics(&self) -> Result<CacheStatistics> {
        let stats = self.index.statistics().await?;
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total_lookups = hits + misses;
        let hit_rate = if total_lookups == 0 {
            0.0
        } else {
            hits as f64 / total_lookups as f64
        };
        let avg_entry_size = if stats.entry_count == 0 {
            0.0
        } else {
            stats.total_bytes as f64 / stats.entry_count as f64
        };
        Ok(CacheStatistics {
            entry_count: stats.entry_count,
            total_bytes: stats.total_bytes,
            hit_rate,
            avg_entry_size,
            policy: self.config.eviction_policy.name(),
        })
    }
}

impl<S: ContentStore + 'static> ContentAddressableCache<S> {
    /// Spawn the periodic GC task. Runs until `cancellation` fires.
    pub fn spawn_gc_task(
        cache: Arc<Self>,
        cancellation: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let interval = cache.config.gc_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancellation.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = cache.run_gc().await {
                            error!(error = %err, "cache GC pass failed");
                        }
                    }
                }
            }
        })
    }
}
