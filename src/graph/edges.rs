//! Edge types for workflow graphs.
//!
//! Static edges are plain `(from, to)` pairs stored on the graph. A
//! [`ConditionalEdge`] carries a predicate evaluated against a state
//! snapshot after its source node runs; the returned label is looked up in
//! the edge's path map to pick the target node.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::node::NodeError;
use crate::state::State;

/// Predicate deciding where a conditional edge routes.
///
/// Receives a snapshot of state (after the source node's update has been
/// merged) and returns a label to look up in the path map.
pub type EdgePredicate = Arc<dyn Fn(&State) -> Result<String, NodeError> + Send + Sync>;

/// A state-dependent edge from one node to a set of possible targets.
#[derive(Clone)]
pub struct ConditionalEdge {
    from: String,
    predicate: EdgePredicate,
    path_map: FxHashMap<String, String>,
}

impl ConditionalEdge {
    pub fn new(
        from: impl Into<String>,
        predicate: EdgePredicate,
        path_map: FxHashMap<String, String>,
    ) -> Self {
        Self {
            from: from.into(),
            predicate,
            path_map,
        }
    }

    #[must_use]
    pub fn from_node(&self) -> &str {
        &self.from
    }

    #[must_use]
    pub fn path_map(&self) -> &FxHashMap<String, String> {
        &self.path_map
    }

    /// Evaluates the predicate and resolves the label to a target node ID.
    ///
    /// A label with no path-map entry is a routing error: the path map is
    /// the edge's whole contract, and silently dropping a branch would leave
    /// the run stuck with no diagnostic.
    pub fn resolve(&self, state: &State) -> Result<String, NodeError> {
        let label = (self.predicate)(state)?;
        self.path_map
            .get(&label)
            .cloned()
            .ok_or_else(|| NodeError::Routing {
                message: format!(
                    "conditional edge from '{}' produced label '{label}' with no path mapping",
                    self.from
                ),
            })
    }
}

impl std::fmt::Debug for ConditionalEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionalEdge")
            .field("from", &self.from)
            .field("path_map", &self.path_map)
            .finish_non_exhaustive()
    }
}
