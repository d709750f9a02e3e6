//! Per-stage execution context: mutable build state plus the
//! snapshot prepare/commit/cleanup wrapper.

use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::graph::BuildGraph;
use crate::platform::Platform;
use crate::snapshot::{Snapshot, Snapshotter};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};

/// Image configuration fields carried across operations and patched in
/// by cache hits. Not exhaustive of the OCI image-config schema — only
/// the fields this core reads or mutates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub exposed_ports: Vec<String>,
}

/// Environment variable deltas produced by an operation, applied to a
/// context on a cache hit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentChanges {
    pub set: BTreeMap<String, String>,
    pub unset: Vec<String>,
}

impl EnvironmentChanges {
    pub fn apply(&self, environment: &mut HashMap<String, String>) {
        for key in &self.unset {
            environment.remove(key);
        }
        for (key, value) in &self.set {
            environment.insert(key.clone(), value.clone());
        }
    }
}

/// Working-directory/user/image-config deltas produced by an
/// operation, applied to a context on a cache hit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataChanges {
    pub working_directory: Option<String>,
    pub user: Option<String>,
    pub image_config: Option<ImageConfig>,
}

impl MetadataChanges {
    pub fn apply(&self, state: &mut MutableState) {
        if let Some(wd) = &self.working_directory {
            state.working_directory = wd.clone();
        }
        if let Some(user) = &self.user {
            state.user = user.clone();
        }
        if let Some(config) = &self.image_config {
            state.image_config = config.clone();
        }
    }
}

/// Fields guarded by the context's mutual-exclusion lock. Critical
/// sections over this state must stay short — no I/O while held.
#[derive(Debug, Clone, Default)]
pub struct MutableState {
    pub environment: HashMap<String, String>,
    pub working_directory: String,
    pub user: String,
    pub image_config: ImageConfig,
    pub snapshots: HashMap<String, Snapshot>,
    pub active_snapshots: HashMap<String, Snapshot>,
    pub head_snapshot: Option<Snapshot>,
}

/// Thread-safe holder for one build stage: mutable environment/user/
/// working-directory/image-config state, the stage's build graph, and
/// the snapshot prepare/commit/cleanup wrapper around a [`Snapshotter`].
pub struct ExecutionContext {
    pub stage: String,
    pub graph: BuildGraph,
    pub platform: Platform,
    snapshotter: Arc<dyn Snapshotter>,
    state: Mutex<MutableState>,
    /// Serializes filesystem-mutating operations within this context;
    /// permits across different contexts do not interfere.
    fs_permit: Semaphore,
    mountpoint_root: PathBuf,
}

impl ExecutionContext {
    pub fn new(
        stage: impl Into<String>,
        graph: BuildGraph,
        platform: Platform,
        snapshotter: Arc<dyn Snapshotter>,
        mountpoint_root: PathBuf,
    ) -> Self {
        Self {
            stage: stage.into(),
            graph,
            platform,
            snapshotter,
            state: Mutex::new(MutableState::default()),
            fs_permit: Semaphore::new(1),
            mountpoint_root,
        }
    }

    /// Run `body` with exclusive access to the mutable state.
    pub async fn with_state<R>(&self, body: impl FnOnce(&mut MutableState) -> R) -> R {
        let mut guard = self.state.lock().await;
        body(&mut guard)
    }

    fn op_mountpoint(&self, op_id: &str) -> PathBuf {
        self.mountpoint_root.join(op_id)
    }

    /// Build a new child snapshot, assign it a per-operation mountpoint,
    /// prepare it, and record it active. `base` pins the parent digest
    /// explicitly (e.g. `Some(Digest::ZERO)` for a parentless base-image
    /// snapshot); `None` roots it at the context's current head, or at
    /// the zero-digest sentinel when there is no head yet.
    pub async fn prepare_snapshot(&self, op_id: &str, base: Option<Digest>) -> Result<Snapshot> {
        let parent = match base {
            Some(digest) => Some(digest),
            None => {
                let guard = self.state.lock().await;
                guard
                    .head_snapshot
                    .as_ref()
                    .map(|s| s.digest)
                    .or(Some(Digest::ZERO))
            }
        };
        let snapshot = Snapshot::new(parent, self.op_mountpoint(op_id));
        let prepared = self.snapshotter.prepare(snapshot).await?;
        let mut guard = self.state.lock().await;
        guard
            .active_snapshots
            .insert(op_id.to_string(), prepared.clone());
        Ok(prepared)
    }

    /// Commit an active snapshot, move it from `active_snapshots` to
    /// `snapshots[op_id]`, and update `head_snapshot`.
    pub async fn commit_snapshot(&self, snap: Snapshot, op_id: &str) -> Result<Snapshot> {
        let committed = self.snapshotter.commit(snap).await?;
        let mut guard = self.state.lock().await;
        guard.active_snapshots.remove(op_id);
        guard
            .snapshots
            .insert(op_id.to_string(), committed.clone());
        guard.head_snapshot = Some(committed.clone());
        Ok(committed)
    }

    /// Remove the active snapshot for `op_id`, releasing its
    /// resources. Errors are reported but non-fatal.
    pub async fn cleanup_snapshot(&self, op_id: &str) {
        let active = {
            let mut guard = self.state.lock().await;
            guard.active_snapshots.remove(op_id)
        };
        if let Some(snapshot) = active {
            if let Err(err) = self.snapshotter.remove(snapshot).await {
                tracing::warn!(op_id, error = %err, "snapshot cleanup failed");
            }
        }
    }

    /// Acquire the FS permit, prepare (rooted at `base`, or at head when
    /// `base` is `None`), run `body(snap)`, commit on success, clean up
    /// on failure.
    pub async fn with_snapshot<F, Fut, R>(
        &self,
        op_id: &str,
        base: Option<Digest>,
        body: F,
    ) -> Result<(R, Snapshot)>
    where
        F: FnOnce(Snapshot) -> Fut,
        Fut: std::future::Future<Output = Result<(R, Snapshot)>>,
    {
        let _permit = self
            .fs_permit
            .acquire()
            .await
            .map_err(|e| Error::ExecutionFailed(format!("fs permit closed: {e}")))?;

        let prepared = self.prepare_snapshot(op_id, base).await?;
        match body(prepared).await {
            Ok((result, snap)) => {
                let committed = self.commit_snapshot(snap, op_id).await?;
                Ok((result, committed))
            }
            Err(err) => {
                self.cleanup_snapshot(op_id).await;
                Err(err)
            }
        }
    }

    /// Convenience for operations with no body side effects — prepare
    /// (rooted at `base`, or at head when `base` is `None`) then
    /// immediately commit. Base-image load passes `Some(Digest::ZERO)`
    /// to produce a parentless snapshot regardless of the context's
    /// current head.
    pub async fn prepare_and_commit(&self, op_id: &str, base: Option<Digest>) -> Result<Snapshot> {
        let _permit = self
            .fs_permit
            .acquire()
            .await
            .map_err(|e| Error::ExecutionFailed(format!("fs permit closed: {e}")))?;
        let prepared = self.prepare_snapshot(op_id, base).await?;
        self.commit_snapshot(prepared, op_id).await
    }

    /// The most recently committed snapshot for this stage, if any.
    pub async fn head_snapshot(&self) -> Option<Snapshot> {
        self.state.lock().await.head_snapshot.clone()
    }
}
