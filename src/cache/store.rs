//! Content store abstraction consumed by the cache (§6). The real
//! store — tar/gzip layer codec, registry transport, on-disk blob
//! layout — lives outside this crate's scope; this is the
//! ingest-session-shaped interface the cache programs against.

use crate::digest::Digest;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

/// A handle for an in-flight write. Exactly one of `complete`/`cancel`
/// must be called per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IngestSession(pub Uuid);

/// Blob store with ingest-session write semantics, consumed by
/// [`super::ContentAddressableCache`] to persist manifests.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Begin a write. Returns a session handle.
    async fn new_ingest_session(&self) -> Result<IngestSession>;

    /// Serialize and write `value` within `session`, returning its
    /// canonical size and digest.
    async fn write<T: Serialize + Sync>(
        &self,
        session: IngestSession,
        value: &T,
    ) -> Result<(u64, Digest)>;

    /// Finalize a session, making its write durable and addressable.
    async fn complete_ingest_session(&self, session: IngestSession) -> Result<()>;

    /// Abandon a session; any write performed under it is discarded.
    async fn cancel_ingest_session(&self, session: IngestSession) -> Result<()>;

    /// Fetch and deserialize a value by digest.
    async fn get<T: DeserializeOwned>(&self, digest: Digest) -> Result<Option<T>>;

    /// Remove a set of blobs by digest.
    async fn delete(&self, digests: &[Digest]) -> Result<()>;
}

/// In-memory [`ContentStore`] used by cache tests.
#[derive(Default)]
pub struct MemoryContentStore {
    blobs: Mutex<HashMap<Digest, Vec<u8>>>,
    pending: Mutex<HashMap<Uuid, Vec<(Digest, Vec<u8>)>>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn new_ingest_session(&self) -> Result<IngestSession> {
        let id = Uuid::new_v4();
        self.pending.lock().unwrap().insert(id, Vec::new());
        Ok(IngestSession(id))
    }

    async fn write<T: Serialize + Sync>(
        &self,
        session: IngestSession,
        value: &T,
    ) -> Result<(u64, Digest)> {
        let bytes = serde_json::to_vec(value)?;
        let digest = Digest::of(&bytes);
        let size = bytes.len() as u64;
        let mut pending = self.pending.lock().unwrap();
        let entries = pending
            .get_mut(&session.0)
            .ok_or_else(|| Error::NotFound(format!("ingest session {} not found", session.0)))?;
        entries.push((digest, bytes));
        Ok((size, digest))
    }

    async fn complete_ingest_session(&self, session: IngestSession) -> Result<()> {
        let entries = self
            .pending
            .lock()
            .unwrap()
            .remove(&session.0)
            .ok_or_else(|| Error::NotFound(format!("ingest session {} not found", session.0)))?;
        let mut blobs = self.blobs.lock().unwrap();
        for (digest, bytes) in entries {
            blobs.insert(digest, bytes);
        }
        Ok(())
    }

    async fn cancel_ingest_session(&self, session: IngestSession) -> Result<()> {
        self.pending.lock().unwrap().remove(&session.0);
        Ok(())
    }

    async fn get<T: DeserializeOwned>(&self, digest: Digest) -> Result<Option<T>> {
        let blobs = self.blobs.lock().unwrap();
        match blobs.get(&digest) {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, digests: &[Digest]) -> Result<()> {
        let mut blobs = self.blobs.lock().unwrap();
        for digest in digests {
            blobs.remove(digest);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Payload {
        value: String,
    }

    #[tokio::test]
    async fn write_then_get_after_complete() {
        let store = MemoryContentStore::new();
        let session = store.new_ingest_session().await.unwrap();
        let payload = Payload {
            value: "hello".to_string(),
        };
        let (_, digest) = store.write(session, &payload).await.unwrap();
        store.complete_ingest_session(session).await.unwrap();
        let fetched: Option<Payload> = store.get(digest).await.unwrap();
        assert_eq!(fetched, Some(payload));
    }

    #[tokio::test]
    async fn cancelled_session_never_becomes_visible() {
        let store = MemoryContentStore::new();
        let session = store.new_ingest_session().await.unwrap();
        let (_, digest) = store.write(session, &Payload { value: "x".to_string() }).await.unwrap();
        store.cancel_ingest_session(session).await.unwrap();
        let fetched: Option<Payload> = store.get(digest).await.unwrap();
        assert_eq!(fetched, None);
    }

    #[tokio::test]
    async fn delete_removes_blob() {
        let store = MemoryContentStore::new();
        let session = store.new_ingest_session().await.unwrap();
        let (_, digest) = store.write(session, &Payload { value: "x".to_string() }).await.unwrap();
        store.complete_ingest_session(session).await.unwrap();
        store.delete(&[digest]).await.unwrap();
        let fetched: Option<Payload> = store.get(digest).await.unwrap();
        assert_eq!(fetched, None);
    }
}
