//! Snapshot entity and its lifecycle state machine.

use crate::digest::Digest;
use crate::diffkey::DiffKey;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// A snapshot's position in its lifecycle. `Prepared` and `InProgress`
/// are mutable (backed by a host mountpoint); `Committed` is terminal
/// and immutable — there is no transition out of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotState {
    Prepared { mountpoint: PathBuf },
    InProgress { operation_id: String },
    Committed {
        layer_digest: Option<Digest>,
        layer_size: Option<u64>,
        layer_media_type: Option<String>,
        diff_key: Option<DiffKey>,
    },
    Removed,
}

/// A filesystem snapshot taken between two build graph operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub digest: Digest,
    pub size: u64,
    pub parent: Option<Digest>,
    pub created_at: DateTime<Utc>,
    pub state: SnapshotState,
}

impl Snapshot {
    /// A fresh, unprepared snapshot rooted at `parent` (or scratch if
    /// `parent` is `None`, per the 32-zero-byte sentinel used by
    /// [`crate::context::ExecutionContext`]).
    pub fn new(parent: Option<Digest>, mountpoint: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            digest: Digest::ZERO,
            size: 0,
            parent,
            created_at: Utc::now(),
            state: SnapshotState::Prepared { mountpoint },
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self.state, SnapshotState::Committed { .. })
    }

    /// Transition `prepared → inProgress`. Fails if not currently
    /// `prepared`.
    pub fn into_in_progress(mut self, operation_id: impl Into<String>) -> Result<Self> {
        match self.state {
            SnapshotState::Prepared { .. } => {
                self.state = SnapshotState::InProgress {
                    operation_id: operation_id.into(),
                };
                Ok(self)
            }
            other => Err(Error::InvalidState(format!(
                "cannot move snapshot {} to inProgress from {other:?}",
                self.id
            ))),
        }
    }

    /// Transition to the terminal `committed` state. Legal from either
    /// `prepared` (lock skipped) or `inProgress`.
    pub fn into_committed(
        mut self,
        digest: Digest,
        size: u64,
        layer_digest: Option<Digest>,
        layer_size: Option<u64>,
        layer_media_type: Option<String>,
        diff_key: Option<DiffKey>,
    ) -> Result<Self> {
        match self.state {
            SnapshotState::Prepared { .. } | SnapshotState::InProgress { .. } => {
                self.digest = digest;
                self.size = size;
                self.state = SnapshotState::Committed {
                    layer_digest,
                    layer_size,
                    layer_media_type,
                    diff_key,
                };
                Ok(self)
            }
            SnapshotState::Committed { .. } => Err(Error::InvalidState(format!(
                "snapshot {} is already committed",
                self.id
            ))),
            SnapshotState::Removed => Err(Error::InvalidState(format!(
                "snapshot {} was removed",
                self.id
            ))),
        }
    }

    /// Transition `prepared → removed`. Cleanup on failure; legal from
    /// any non-committed state.
    pub fn into_removed(mut self) -> Result<Self> {
        match self.state {
            SnapshotState::Committed { .. } => Err(Error::InvalidState(format!(
                "cannot remove committed snapshot {}",
                self.id
            ))),
            _ => {
                self.state = SnapshotState::Removed;
                Ok(self)
            }
        }
    }
}

/// Backing implementation of the snapshot lifecycle's three
/// operations. A real implementation drives the host mount/unmount
/// primitives; [`NullSnapshotter`] is a test double.
#[async_trait]
pub trait Snapshotter: Send + Sync {
    /// Ensure the working mountpoint exists. If `parent` is present but
    /// not materialized, materialize it first. Idempotent when already
    /// `prepared`.
    async fn prepare(&self, snapshot: Snapshot) -> Result<Snapshot>;

    /// Produce the immutable, terminal form of the snapshot.
    async fn commit(&self, snapshot: Snapshot) -> Result<Snapshot>;

    /// Release the mountpoint and any in-progress state. Safe to call
    /// on a prepared or committed snapshot.
    async fn remove(&self, snapshot: Snapshot) -> Result<()>;
}

/// In-memory [`Snapshotter`] that performs no host I/O — used by
/// executor and scheduler tests.
#[derive(Debug, Default)]
pub struct NullSnapshotter;

#[async_trait]
impl Snapshotter for NullSnapshotter {
    async fn prepare(&self, snapshot: Snapshot) -> Result<Snapshot> {
        match snapshot.state {
            SnapshotState::Prepared { .. } => Ok(snapshot),
            _ => Err(Error::InvalidState(format!(
                "snapshot {} is not preparable from its current state",
                snapshot.id
            ))),
        }
    }

    async fn commit(&self, snapshot: Snapshot) -> Result<Snapshot> {
        let digest = Digest::of(snapshot.id.as_bytes());
        snapshot.into_committed(digest, 0, None, None, None, None)
    }

    async fn remove(&self, snapshot: Snapshot) -> Result<()> {
        snapshot.into_removed().map(|_| ())
    }
}
