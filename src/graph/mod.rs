//! Workflow graph definition and compilation.
//!
//! A graph is built with [`GraphBuilder`] and compiled into an immutable
//! [`Graph`]: nodes with their writer/trigger channel lists, static and
//! conditional edges, the entry point, a precomputed trigger map (channel
//! name → triggered nodes), and graph-level configuration (schema, cache,
//! callbacks, retry and cache policy defaults, interrupt point sets).
//!
//! Structural invariants are enforced at compile time: unique node IDs,
//! existing edge endpoints (modulo the virtual `__start__`/`__end__`), a
//! registered entry point, and reachability of every node from it.

mod builder;
mod edges;
#[cfg(test)]
mod tests;

pub use builder::{GraphBuilder, NodeOptions};
pub use edges::{ConditionalEdge, EdgePredicate};

use std::sync::Arc;

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::cache::{Cache, CacheKeySelector, CachePolicy};
use crate::callbacks::NodeCallbacks;
use crate::node::Node;
use crate::retry::RetryPolicy;
use crate::state::StateSchema;
use crate::types::NodeType;

/// Structural errors surfaced when compiling a graph.
#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("duplicate node id: {id}")]
    #[diagnostic(code(graphflow::graph::duplicate_node))]
    DuplicateNode { id: String },

    #[error("cannot register virtual node: {id}")]
    #[diagnostic(
        code(graphflow::graph::virtual_node),
        help("`__start__` and `__end__` are structural endpoints; add edges to them instead.")
    )]
    VirtualNode { id: String },

    #[error("no entry point set")]
    #[diagnostic(
        code(graphflow::graph::missing_entry_point),
        help("Call GraphBuilder::set_entry_point with the first node to run.")
    )]
    MissingEntryPoint,

    #[error("entry point '{id}' is not a registered node")]
    #[diagnostic(code(graphflow::graph::unknown_entry_point))]
    UnknownEntryPoint { id: String },

    #[error("edge references unknown node: {from} -> {to}")]
    #[diagnostic(code(graphflow::graph::dangling_edge))]
    DanglingEdge { from: String, to: String },

    #[error("conditional edge from '{from}' maps label '{label}' to unknown node '{target}'")]
    #[diagnostic(code(graphflow::graph::dangling_conditional))]
    DanglingConditionalTarget {
        from: String,
        label: String,
        target: String,
    },

    #[error("node '{id}' is unreachable from the entry point")]
    #[diagnostic(
        code(graphflow::graph::unreachable),
        help("Connect '{id}' with an edge, a conditional path, or declare it as a destination.")
    )]
    Unreachable { id: String },
}

/// A node as compiled into the graph: function plus routing metadata and
/// per-node configuration.
#[derive(Clone)]
pub struct NodeEntry {
    pub id: String,
    pub name: String,
    pub node_type: NodeType,
    pub function: Arc<dyn Node>,
    /// Channels written on successful static fan-forward.
    pub writers: Vec<String>,
    /// Channels whose updates fire this node.
    pub triggers: Vec<String>,
    pub callbacks: NodeCallbacks,
    pub retry_policies: Vec<RetryPolicy>,
    pub cache_policy: Option<CachePolicy>,
    pub cache_key_selector: Option<CacheKeySelector>,
    /// Declared `Command.goto` targets, for reachability analysis.
    pub destinations: Vec<String>,
    pub interrupt_before: bool,
    pub interrupt_after: bool,
}

impl std::fmt::Debug for NodeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeEntry")
            .field("id", &self.id)
            .field("node_type", &self.node_type)
            .field("writers", &self.writers)
            .field("triggers", &self.triggers)
            .finish_non_exhaustive()
    }
}

/// Immutable compiled topology.
pub struct Graph {
    pub(crate) nodes: FxHashMap<String, Arc<NodeEntry>>,
    pub(crate) edges: FxHashMap<String, Vec<String>>,
    pub(crate) conditional_edges: FxHashMap<String, ConditionalEdge>,
    pub(crate) entry_point: String,
    pub(crate) trigger_map: FxHashMap<String, Vec<String>>,
    pub(crate) schema: StateSchema,
    pub(crate) cache: Option<Arc<dyn Cache>>,
    pub(crate) callbacks: NodeCallbacks,
    pub(crate) default_retry_policies: Vec<RetryPolicy>,
    pub(crate) default_cache_policy: Option<CachePolicy>,
    pub(crate) interrupt_before: FxHashSet<String>,
    pub(crate) interrupt_after: FxHashSet<String>,
}

impl Graph {
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&Arc<NodeEntry>> {
        self.nodes.get(id)
    }

    #[must_use]
    pub fn nodes(&self) -> &FxHashMap<String, Arc<NodeEntry>> {
        &self.nodes
    }

    #[must_use]
    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    /// Static edge targets of a node.
    #[must_use]
    pub fn edges_from(&self, id: &str) -> &[String] {
        self.edges.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    #[must_use]
    pub fn conditional_edge(&self, id: &str) -> Option<&ConditionalEdge> {
        self.conditional_edges.get(id)
    }

    /// Precomputed map from trigger channel name to triggered node IDs.
    #[must_use]
    pub fn trigger_map(&self) -> &FxHashMap<String, Vec<String>> {
        &self.trigger_map
    }

    /// Nodes fired by a channel, empty when the channel triggers nothing.
    #[must_use]
    pub fn triggered_nodes(&self, channel: &str) -> &[String] {
        self.trigger_map
            .get(channel)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn schema(&self) -> &StateSchema {
        &self.schema
    }

    #[must_use]
    pub fn cache(&self) -> Option<&Arc<dyn Cache>> {
        self.cache.as_ref()
    }

    /// Global callbacks merged with per-node sets at execution time.
    #[must_use]
    pub fn callbacks(&self) -> &NodeCallbacks {
        &self.callbacks
    }

    /// The cache policy in effect for a node: per-node over graph default.
    /// Only meaningful when a cache is attached.
    #[must_use]
    pub fn effective_cache_policy<'a>(&'a self, node: &'a NodeEntry) -> Option<&'a CachePolicy> {
        node.cache_policy
            .as_ref()
            .or(self.default_cache_policy.as_ref())
    }

    /// Retry policies in effect for a node: per-node list, else graph
    /// defaults.
    #[must_use]
    pub fn effective_retry_policies<'a>(&'a self, node: &'a NodeEntry) -> &'a [RetryPolicy] {
        if node.retry_policies.is_empty() {
            &self.default_retry_policies
        } else {
            &node.retry_policies
        }
    }

    /// Whether a static interrupt point is registered before this node.
    #[must_use]
    pub fn interrupts_before(&self, id: &str) -> bool {
        self.interrupt_before.contains(id)
            || self.nodes.get(id).is_some_and(|n| n.interrupt_before)
    }

    /// Whether a static interrupt point is registered after this node.
    #[must_use]
    pub fn interrupts_after(&self, id: &str) -> bool {
        self.interrupt_after.contains(id)
            || self.nodes.get(id).is_some_and(|n| n.interrupt_after)
    }

    /// All channels declared by the topology (writers and triggers of every
    /// node), sorted. Channels created at runtime (`input:<key>`, lazily
    /// materialized `trigger:<node>`) are not included.
    #[must_use]
    pub fn all_channels(&self) -> Vec<String> {
        let mut channels: FxHashSet<String> = FxHashSet::default();
        for node in self.nodes.values() {
            channels.extend(node.writers.iter().cloned());
            channels.extend(node.triggers.iter().cloned());
        }
        let mut channels: Vec<String> = channels.into_iter().collect();
        channels.sort();
        channels
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.nodes.len())
            .field("entry_point", &self.entry_point)
            .field("edges", &self.edges)
            .finish_non_exhaustive()
    }
}
