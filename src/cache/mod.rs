//! Content-addressable build cache: key derivation, durable index,
//! manifest encoding, content store abstraction, and the cache itself
//! with TTL/size-bounded eviction.

mod cache;
mod index;
mod manifest;
mod store;

pub use cache::{CacheConfiguration, CacheStatistics, ContentAddressableCache, EvictionPolicy};
pub use index::{CacheIndex, CacheIndexEntry};
pub use manifest::{CacheKey, CacheManifest, CachedResult, Descriptor, ManifestConfig};
pub use store::{ContentStore, IngestSession, MemoryContentStore};
