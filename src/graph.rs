//! Build graph: a DAG of operations walked in dependency order.

use crate::digest::Digest;
use crate::error::{Error, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identifies one node in a [`BuildGraph`].
pub type OperationId = String;

/// A single file change performed by a `Filesystem` operation. Side
/// effects are stubbed (spec's Non-goals): this only records what
/// would be copied/added, not the bytes themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub source: String,
    pub destination: String,
}

/// The tagged set of operations a [`BuildGraph`] node may carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Image { base_ref: String },
    Filesystem { changes: Vec<FileChange> },
    Exec {
        command: Vec<String>,
        env: HashMap<String, String>,
    },
}

impl Operation {
    /// Content digest identifying this operation's intent, used as the
    /// `operationDigest` component of a `CacheKey`.
    pub fn content_digest(&self) -> Result<Digest> {
        let encoded = serde_json::to_vec(self)?;
        Ok(Digest::of(&encoded))
    }
}

/// One node in the build graph: an operation plus the ids of the
/// operations it depends on.
#[derive(Debug, Clone)]
pub struct OperationNode {
    pub id: OperationId,
    pub op: Operation,
}

/// A DAG of operations to be executed in dependency order.
pub struct BuildGraph {
    graph: DiGraph<OperationNode, ()>,
    index_by_id: HashMap<OperationId, NodeIndex>,
}

impl BuildGraph {
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            index_by_id: HashMap::new(),
        }
    }

    /// Insert a node. `dependencies` must already be present in the
    /// graph.
    pub fn add_operation(
        &mut self,
        id: impl Into<OperationId>,
        op: Operation,
        dependencies: &[OperationId],
    ) -> Result<()> {
        let id = id.into();
        if self.index_by_id.contains_key(&id) {
            return Err(Error::Exists(format!("operation {id} already in graph")));
        }
        let idx = self.graph.add_node(OperationNode {
            id: id.clone(),
            op,
        });
        self.index_by_id.insert(id.clone(), idx);
        for dep in dependencies {
            let dep_idx = self
                .index_by_id
                .get(dep)
                .ok_or_else(|| Error::NotFound(format!("dependency {dep} not in graph")))?;
            self.graph.add_edge(*dep_idx, idx, ());
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&OperationNode> {
        self.index_by_id.get(id).map(|idx| &self.graph[*idx])
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Topologically ordered operation ids. Fails with
    /// [`Error::InvalidState`] if the graph contains a cycle.
    pub fn execution_order(&self) -> Result<Vec<OperationId>> {
        let sorted = toposort(&self.graph, None)
            .map_err(|cycle| Error::InvalidState(format!("build graph has a cycle at {:?}", cycle.node_id())))?;
        Ok(sorted.into_iter().map(|idx| self.graph[idx].id.clone()).collect())
    }
}

impl Default for BuildGraph {
    fn default() -> Self {
        Self::new()
    }
}
