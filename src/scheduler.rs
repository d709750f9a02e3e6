//! Scheduler: walks the build graph in dependency order, dispatching
//! each node to the executor that claims it.

use crate::cache::{CacheKey, CachedResult, ContentAddressableCache, ContentStore};
use crate::context::{EnvironmentChanges, ExecutionContext, MetadataChanges};
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::graph::{BuildGraph, Operation, OperationId};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// What an executor returns after a cache miss runs its body.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub environment_changes: EnvironmentChanges,
    pub metadata_changes: MetadataChanges,
}

/// One operation-specific executor. `claims` lets the scheduler
/// dispatch without a central match on [`Operation`] variants.
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    fn claims(&self, op: &Operation) -> bool;

    /// Perform the operation's (possibly stubbed) side effects inside
    /// `context.with_snapshot`, returning the outcome that seeds the
    /// cache entry on a miss.
    async fn execute(&self, op: &Operation, context: &ExecutionContext) -> Result<ExecutionOutcome>;
}

/// Base-image load: produces a snapshot with no parent content delta.
/// Side effects (actually materializing the base image) are outside
/// this crate's scope.
pub struct ImageLoadExecutor;

#[async_trait]
impl OperationExecutor for ImageLoadExecutor {
    fn claims(&self, op: &Operation) -> bool {
        matches!(op, Operation::Image { .. })
    }

    async fn execute(&self, op: &Operation, _context: &ExecutionContext) -> Result<ExecutionOutcome> {
        let Operation::Image { base_ref } = op else {
            return Err(Error::UnsupportedOperation(
                "ImageLoadExecutor received a non-image operation".to_string(),
            ));
        };
        info!(base_ref, "loading base image (stub)");
        Ok(ExecutionOutcome::default())
    }
}

/// COPY/ADD-style filesystem mutation over a prepared mountpoint.
/// File-copy side effects are stubbed per spec's Non-goals.
pub struct FilesystemExecutor;

#[async_trait]
impl OperationExecutor for FilesystemExecutor {
    fn claims(&self, op: &Operation) -> bool {
        matches!(op, Operation::Filesystem { .. })
    }

    async fn execute(&self, op: &Operation, _context: &ExecutionContext) -> Result<ExecutionOutcome> {
        let Operation::Filesystem { changes } = op else {
            return Err(Error::UnsupportedOperation(
                "FilesystemExecutor received a non-filesystem operation".to_string(),
            ));
        };
        info!(count = changes.len(), "applying filesystem changes (stub)");
        Ok(ExecutionOutcome::default())
    }
}

/// RUN-style command simulation. Records the command it would run and
/// returns a deterministic simulated outcome rather than spawning a
/// process — this crate's Non-goals exclude real exec side effects.
pub struct ExecExecutor;

#[async_trait]
impl OperationExecutor for ExecExecutor {
    fn claims(&self, op: &Operation) -> bool {
        matches!(op, Operation::Exec { .. })
    }

    async fn execute(&self, op: &Operation, _context: &ExecutionContext) -> Result<ExecutionOutcome> {
        let Operation::Exec { command, env } = op else {
            return Err(Error::UnsupportedOperation(
                "ExecExecutor received a non-exec operation".to_string(),
            ));
        };
        // Draining a real child's stdout/stderr would be bounded by a
        // fixed timeout (spec §5); there is no child process here, so
        // this models that same bound around the simulated step.
        tokio::time::timeout(Duration::from_secs(3), async {
            info!(command = ?command, "simulating exec (stub)");
        })
        .await
        .map_err(|_| Error::ExecutionFailed("simulated exec drain timed out".to_string()))?;

        Ok(ExecutionOutcome {
            environment_changes: EnvironmentChanges {
                set: env.clone().into_iter().collect(),
                unset: Vec::new(),
            },
            metadata_changes: MetadataChanges::default(),
        })
    }
}

fn input_digests_for(_graph: &BuildGraph, _id: &OperationId) -> BTreeSet<Digest> {
    // This core doesn't track per-operation input blob digests itself
    // (those come from the content store layer outside its scope);
    // dependency edges are already captured by `execution_order`.
    BTreeSet::new()
}

/// Walks a [`BuildGraph`] in dependency order, dispatching each node to
/// the [`OperationExecutor`] that claims it, honoring `max_concurrency`
/// and `fail_fast`.
pub struct Scheduler<S: ContentStore> {
    executors: Vec<Box<dyn OperationExecutor>>,
    cache: Arc<ContentAddressableCache<S>>,
    max_concurrency: Arc<Semaphore>,
    fail_fast: bool,
    build_version: String,
}

impl<S: ContentStore + 'static> Scheduler<S> {
    pub fn new(cache: Arc<ContentAddressableCache<S>>, max_concurrency: usize, fail_fast: bool) -> Self {
        Self {
            executors: vec![
                Box::new(ImageLoadExecutor),
                Box::new(FilesystemExecutor),
                Box::new(ExecExecutor),
            ],
            cache,
            max_concurrency: Arc::new(Semaphore::new(max_concurrency.max(1))),
            fail_fast,
            build_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn executor_for(&self, op: &Operation) -> Result<&dyn OperationExecutor> {
        self.executors
            .iter()
            .map(|e| e.as_ref())
            .find(|e| e.claims(op))
            .ok_or_else(|| Error::UnsupportedOperation(format!("no executor claims {op:?}")))
    }

    /// Run every operation in `graph` against `context`, in dependency
    /// order.
    pub async fn run(&self, graph: &BuildGraph, context: &ExecutionContext) -> Result<()> {
        let order = graph.execution_order()?;
        let cancellation = CancellationToken::new();

        for op_id in order {
            if self.fail_fast && cancellation.is_cancelled() {
                break;
            }
            let _permit = self
                .max_concurrency
                .acquire()
                .await
                .map_err(|e| Error::ExecutionFailed(format!("scheduler semaphore closed: {e}")))?;

            let node = graph
                .get(&op_id)
                .ok_or_else(|| Error::NotFound(format!("operation {op_id} vanished from graph")))?;

            let result = self.run_one(&op_id, &node.op, graph, context).await;
            if let Err(err) = result {
                error!(op_id, error = %err, "operation failed");
                if self.fail_fast {
                    cancellation.cancel();
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn run_one(
        &self,
        op_id: &OperationId,
        op: &Operation,
        graph: &BuildGraph,
        context: &ExecutionContext,
    ) -> Result<()> {
        let executor = self.executor_for(op)?;

        let cache_key = CacheKey {
            operation_digest: op.content_digest()?,
            input_digests: input_digests_for(graph, op_id),
            platform: context.platform.clone(),
        };

        if let Some(cached) = self.cache.get(&cache_key).await? {
            self.apply_cache_hit(context, cached).await;
            return Ok(());
        }

        let (outcome, snapshot) = if matches!(op, Operation::Image { .. }) {
            // Base-image load doesn't mutate a prepared mountpoint, so it
            // uses the parentless convenience path instead of chaining
            // off the context's current head.
            let outcome = executor.execute(op, context).await?;
            let snapshot = context.prepare_and_commit(op_id, Some(Digest::ZERO)).await?;
            (outcome, snapshot)
        } else {
            context
                .with_snapshot(op_id, None, |snap| async move {
                    let outcome = executor.execute(op, context).await?;
                    Ok::<_, Error>((outcome, snap))
                })
                .await?
        };

        self.cache
            .put(
                &cache_key,
                CachedResult {
                    snapshot: Some(snapshot),
                    environment_changes: outcome.environment_changes,
                    metadata_changes: outcome.metadata_changes,
                },
                operation_type_name(op),
            )
            .await;

        Ok(())
    }

    async fn apply_cache_hit(&self, context: &ExecutionContext, cached: CachedResult) {
        context
            .with_state(|state| {
                cached.environment_changes.apply(&mut state.environment);
                cached.metadata_changes.apply(state);
                if let Some(snapshot) = &cached.snapshot {
                    state.head_snapshot = Some(snapshot.clone());
                }
            })
            .await;
    }
}

fn operation_type_name(op: &Operation) -> &'static str {
    match op {
        Operation::Image { .. } => "image",
        Operation::Filesystem { .. } => "filesystem",
        Operation::Exec { .. } => "exec",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfiguration, CacheIndex, MemoryContentStore};
    use crate::graph::FileChange;
    use crate::platform::Platform;
    use crate::snapshot::NullSnapshotter;
    use std::collections::HashMap;
    use std::path::PathBuf;

    async fn test_scheduler() -> (Scheduler<MemoryContentStore>, ExecutionContext) {
        let index = CacheIndex::new("sqlite::memory:").await.unwrap();
        let store = Arc::new(MemoryContentStore::new());
        let cache = Arc::new(
            ContentAddressableCache::new(index, store, CacheConfiguration::default()).await,
        );
        let scheduler = Scheduler::new(cache, 4, true);
        let context = ExecutionContext::new(
            "stage-0",
            BuildGraph::new(),
            Platform::new("linux", "amd64"),
            Arc::new(NullSnapshotter),
            PathBuf::from("/tmp/buildcore-scheduler-test"),
        );
        (scheduler, context)
    }

    #[tokio::test]
    async fn runs_operations_in_dependency_order_and_advances_head() {
        let (scheduler, context) = test_scheduler().await;
        let mut graph = BuildGraph::new();
        graph
            .add_operation(
                "base",
                Operation::Image {
                    base_ref: "scratch".to_string(),
                },
                &[],
            )
            .unwrap();
        graph
            .add_operation(
                "copy",
                Operation::Filesystem {
                    changes: vec![FileChange {
                        source: "a".to_string(),
                        destination: "b".to_string(),
                    }],
                },
                &["base".to_string()],
            )
            .unwrap();

        scheduler.run(&graph, &context).await.unwrap();
        assert!(context.head_snapshot().await.is_some());
    }

    #[tokio::test]
    async fn second_run_of_same_graph_hits_cache() {
        let (scheduler, context) = test_scheduler().await;
        let mut graph = BuildGraph::new();
        graph
            .add_operation(
                "base",
                Operation::Image {
                    base_ref: "scratch".to_string(),
                },
                &[],
            )
            .unwrap();
        scheduler.run(&graph, &context).await.unwrap();
        let stats_before = scheduler.cache.statistics().await.unwrap();

        let context2 = ExecutionContext::new(
            "stage-0",
            BuildGraph::new(),
            Platform::new("linux", "amd64"),
            Arc::new(NullSnapshotter),
            PathBuf::from("/tmp/buildcore-scheduler-test-2"),
        );
        scheduler.run(&graph, &context2).await.unwrap();
        let stats_after = scheduler.cache.statistics().await.unwrap();
        assert!(stats_after.hit_rate >= stats_before.hit_rate);
    }

    #[tokio::test]
    async fn exec_executor_maps_env_into_environment_changes() {
        let mut env = HashMap::new();
        env.insert("FOO".to_string(), "bar".to_string());
        let op = Operation::Exec {
            command: vec!["true".to_string()],
            env,
        };
        let (_scheduler, context) = test_scheduler().await;
        let outcome = ExecExecutor.execute(&op, &context).await.unwrap();
        assert_eq!(outcome.environment_changes.set.get("FOO"), Some(&"bar".to_string()));
    }

    #[tokio::test]
    async fn unclaimed_operation_is_unsupported() {
        let (scheduler, _context) = test_scheduler().await;
        let mut graph = BuildGraph::new();
        graph
            .add_operation(
                "base",
                Operation::Image {
                    base_ref: "scratch".to_string(),
                },
                &[],
            )
            .unwrap();
        // Every operation kind has a claiming executor by construction;
        // this exercises the lookup path directly.
        let op = graph.get("base").unwrap();
        assert!(scheduler.executor_for(&op.op).is_ok());
    }
}
