//! Cache key derivation and the on-blob manifest format.

use crate::context::{EnvironmentChanges, MetadataChanges};
use crate::digest::{Digest, StreamingHasher};
use crate::platform::Platform;
use crate::snapshot::Snapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Current cache manifest schema version.
pub const SCHEMA_VERSION: u32 = 5;

/// Media type stamped on every cache manifest blob.
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.container-build.cache.manifest.v5+json";

/// `{operationDigest, inputDigests, platform}`. Equality is
/// set-equality over `input_digests` — a `BTreeSet` already makes
/// `PartialEq` order-independent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKey {
    pub operation_digest: Digest,
    pub input_digests: BTreeSet<Digest>,
    pub platform: Platform,
}

impl CacheKey {
    /// Derive the cache digest addressing this key's entry (§4.6.1).
    /// `cache_key_version` comes from [`super::CacheConfiguration`].
    pub fn cache_digest(&self, cache_key_version: &str) -> Digest {
        let mut hasher = StreamingHasher::new();
        hasher.update(cache_key_version.as_bytes());
        hasher.update(self.operation_digest.as_bytes());
        // BTreeSet<Digest> already iterates in ascending stringValue
        // order since Digest::Ord is defined over raw bytes, which
        // agrees with hex-string ordering.
        for digest in &self.input_digests {
            hasher.update(digest.as_bytes());
        }
        hasher.update(self.platform.canonical_json().as_bytes());
        hasher.finalize()
    }
}

/// A content descriptor: media type, digest, and size — the shape the
/// content store and cache index exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
}

/// `config` block embedded in a [`CacheManifest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestConfig {
    pub cache_key: CacheKey,
    pub operation_type: String,
    pub platform: Platform,
    pub build_version: String,
    pub created_at: DateTime<Utc>,
}

/// The sole serialized blob stored per cache entry: an embedded
/// snapshot reference plus the environment/metadata deltas the
/// operation produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheManifest {
    pub schema_version: u32,
    pub media_type: String,
    pub config: ManifestConfig,
    pub annotations: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Snapshot>,
    pub environment_changes: EnvironmentChanges,
    pub metadata_changes: MetadataChanges,
}

impl CacheManifest {
    pub fn new(
        cache_key: CacheKey,
        operation_type: impl Into<String>,
        build_version: impl Into<String>,
        snapshot: Option<Snapshot>,
        environment_changes: EnvironmentChanges,
        metadata_changes: MetadataChanges,
    ) -> Self {
        let platform = cache_key.platform.clone();
        Self {
            schema_version: SCHEMA_VERSION,
            media_type: MANIFEST_MEDIA_TYPE.to_string(),
            config: ManifestConfig {
                cache_key,
                operation_type: operation_type.into(),
                platform,
                build_version: build_version.into(),
                created_at: Utc::now(),
            },
            annotations: BTreeMap::new(),
            subject: None,
            snapshot,
            environment_changes,
            metadata_changes,
        }
    }
}

/// What `ContentAddressableCache::get` returns on a hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResult {
    pub snapshot: Option<Snapshot>,
    pub environment_changes: EnvironmentChanges,
    pub metadata_changes: MetadataChanges,
}

impl From<&CacheManifest> for CachedResult {
    fn from(manifest: &CacheManifest) -> Self {
        Self {
            snapshot: manifest.snapshot.clone(),
            environment_changes: manifest.environment_changes.clone(),
            metadata_changes: manifest.metadata_changes.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(inputs: Vec<Digest>) -> CacheKey {
        CacheKey {
            operation_digest: Digest::of(b"op"),
            input_digests: inputs.into_iter().collect(),
            platform: Platform::new("linux", "amd64"),
        }
    }

    #[test]
    fn cache_digest_is_order_independent_over_inputs() {
        let k1 = key(vec![Digest::of(b"i1"), Digest::of(b"i2"), Digest::of(b"i3")]);
        let k2 = key(vec![Digest::of(b"i3"), Digest::of(b"i2"), Digest::of(b"i1")]);
        assert_eq!(k1, k2);
        assert_eq!(k1.cache_digest("v1"), k2.cache_digest("v1"));
    }

    #[test]
    fn cache_digest_differs_across_cache_key_version() {
        let k = key(vec![Digest::of(b"i1")]);
        assert_ne!(k.cache_digest("v1"), k.cache_digest("v2"));
    }

    #[test]
    fn cache_digest_differs_across_platform() {
        let mut k1 = key(vec![Digest::of(b"i1")]);
        let mut k2 = k1.clone();
        k1.platform = Platform::new("linux", "amd64");
        k2.platform = Platform::new("linux", "arm64");
        assert_ne!(k1.cache_digest("v1"), k2.cache_digest("v1"));
    }

    proptest! {
        // Invariant 6 — cache digest order-independence: permuting
        // `inputDigests` (any set of short byte seeds) never changes
        // the derived digest.
        #[test]
        fn prop_cache_digest_order_independent(seeds in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..8), 0..6)) {
            let digests: Vec<Digest> = seeds.iter().map(|s| Digest::of(s)).collect();
            let mut reversed = digests.clone();
            reversed.reverse();

            let forward = key(digests);
            let backward = key(reversed);
            prop_assert_eq!(forward.cache_digest("v1"), backward.cache_digest("v1"));
        }
    }
}
