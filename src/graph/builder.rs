//! GraphBuilder: fluent construction of workflow graphs.

use std::collections::VecDeque;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use super::edges::{ConditionalEdge, EdgePredicate};
use super::{Graph, GraphError, NodeEntry};
use crate::cache::{Cache, CacheKeySelector, CachePolicy};
use crate::callbacks::NodeCallbacks;
use crate::node::Node;
use crate::retry::RetryPolicy;
use crate::state::StateSchema;
use crate::types::{branch_channel, trigger_channel, END, NodeType, START};

/// Per-node configuration supplied at registration time.
#[derive(Clone, Default)]
pub struct NodeOptions {
    /// Human-readable name; defaults to the node ID.
    pub name: Option<String>,
    pub node_type: NodeType,
    pub callbacks: NodeCallbacks,
    pub retry_policies: Vec<RetryPolicy>,
    pub cache_policy: Option<CachePolicy>,
    pub cache_key_selector: Option<CacheKeySelector>,
    /// Declared `Command.goto` targets; needed so dynamic-only targets pass
    /// reachability validation.
    pub destinations: Vec<String>,
    pub interrupt_before: bool,
    pub interrupt_after: bool,
}

impl NodeOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_node_type(mut self, node_type: NodeType) -> Self {
        self.node_type = node_type;
        self
    }

    #[must_use]
    pub fn with_callbacks(mut self, callbacks: NodeCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policies.push(policy);
        self
    }

    #[must_use]
    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn with_cache_key_selector(mut self, selector: CacheKeySelector) -> Self {
        self.cache_key_selector = Some(selector);
        self
    }

    #[must_use]
    pub fn with_destination(mut self, target: impl Into<String>) -> Self {
        self.destinations.push(target.into());
        self
    }

    #[must_use]
    pub fn interrupt_before(mut self) -> Self {
        self.interrupt_before = true;
        self
    }

    #[must_use]
    pub fn interrupt_after(mut self) -> Self {
        self.interrupt_after = true;
        self
    }
}

/// Builder for workflow graphs.
///
/// # Examples
///
/// ```
/// use graphflow::command::NodeOutput;
/// use graphflow::graph::GraphBuilder;
/// use graphflow::node::FnNode;
/// use graphflow::state::State;
/// use serde_json::json;
///
/// let graph = GraphBuilder::new()
///     .add_node(
///         "process",
///         FnNode::new(|_ctx, state: State| async move {
///             let input = state.get_str("input").unwrap_or_default().to_string();
///             Ok(NodeOutput::update(
///                 State::new().with("processed", json!(format!("Processed: {input}"))),
///             ))
///         }),
///     )
///     .set_entry_point("process")
///     .set_finish_point("process")
///     .compile()
///     .unwrap();
/// assert_eq!(graph.entry_point(), "process");
/// ```
pub struct GraphBuilder {
    nodes: FxHashMap<String, (Arc<dyn Node>, NodeOptions)>,
    edges: FxHashMap<String, Vec<String>>,
    conditional_edges: FxHashMap<String, ConditionalEdge>,
    entry_point: Option<String>,
    schema: StateSchema,
    cache: Option<Arc<dyn Cache>>,
    callbacks: NodeCallbacks,
    default_retry_policies: Vec<RetryPolicy>,
    default_cache_policy: Option<CachePolicy>,
    interrupt_before: FxHashSet<String>,
    interrupt_after: FxHashSet<String>,
    issues: Vec<GraphError>,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: FxHashMap::default(),
            edges: FxHashMap::default(),
            conditional_edges: FxHashMap::default(),
            entry_point: None,
            schema: StateSchema::default(),
            cache: None,
            callbacks: NodeCallbacks::default(),
            default_retry_policies: Vec::new(),
            default_cache_policy: None,
            interrupt_before: FxHashSet::default(),
            interrupt_after: FxHashSet::default(),
            issues: Vec::new(),
        }
    }

    /// Attaches the state schema governing reducer-based merges.
    #[must_use]
    pub fn with_schema(mut self, schema: StateSchema) -> Self {
        self.schema = schema;
        self
    }

    /// Attaches a result cache consulted for nodes with a cache policy.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Sets graph-level callbacks, merged with per-node sets at runtime.
    #[must_use]
    pub fn with_callbacks(mut self, callbacks: NodeCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Default retry policies for nodes that declare none.
    #[must_use]
    pub fn with_retry_policies(mut self, policies: Vec<RetryPolicy>) -> Self {
        self.default_retry_policies = policies;
        self
    }

    /// Default cache policy for nodes that declare none.
    #[must_use]
    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.default_cache_policy = Some(policy);
        self
    }

    /// Registers static interrupt points before the given nodes.
    #[must_use]
    pub fn interrupt_before<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interrupt_before.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Registers static interrupt points after the given nodes.
    #[must_use]
    pub fn interrupt_after<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.interrupt_after.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Registers a node with default options.
    #[must_use]
    pub fn add_node(self, id: impl Into<String>, node: impl Node + 'static) -> Self {
        self.add_node_with(id, node, NodeOptions::default())
    }

    /// Registers a node with explicit options.
    #[must_use]
    pub fn add_node_with(
        mut self,
        id: impl Into<String>,
        node: impl Node + 'static,
        options: NodeOptions,
    ) -> Self {
        let id = id.into();
        if id == START || id == END {
            self.issues.push(GraphError::VirtualNode { id });
            return self;
        }
        if self.nodes.contains_key(&id) {
            self.issues.push(GraphError::DuplicateNode { id });
            return self;
        }
        self.nodes.insert(id, (Arc::new(node), options));
        self
    }

    /// Adds a static edge. `__start__` is valid as source, `__end__` as
    /// target.
    #[must_use]
    pub fn add_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.entry(from.into()).or_default().push(to.into());
        self
    }

    /// Adds a conditional edge: after `from` runs, `predicate` picks a label
    /// resolved to a target through `path_map`.
    #[must_use]
    pub fn add_conditional_edge<I, K, V>(
        mut self,
        from: impl Into<String>,
        predicate: EdgePredicate,
        path_map: I,
    ) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let from = from.into();
        let path_map: FxHashMap<String, String> = path_map
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.conditional_edges
            .insert(from.clone(), ConditionalEdge::new(from, predicate, path_map));
        self
    }

    /// Declares the first node to run. The entry point is a real node.
    #[must_use]
    pub fn set_entry_point(mut self, id: impl Into<String>) -> Self {
        self.entry_point = Some(id.into());
        self
    }

    /// Declares a terminal node by adding an edge to `__end__`.
    #[must_use]
    pub fn set_finish_point(self, id: impl Into<String>) -> Self {
        self.add_edge(id, END)
    }

    /// Validates the topology and produces the immutable [`Graph`].
    pub fn compile(mut self) -> Result<Graph, GraphError> {
        if !self.issues.is_empty() {
            return Err(self.issues.remove(0));
        }

        let entry_point = self
            .entry_point
            .clone()
            .ok_or(GraphError::MissingEntryPoint)?;
        if !self.nodes.contains_key(&entry_point) {
            return Err(GraphError::UnknownEntryPoint { id: entry_point });
        }

        for (from, targets) in &self.edges {
            if from != START && !self.nodes.contains_key(from) {
                return Err(GraphError::DanglingEdge {
                    from: from.clone(),
                    to: targets.first().cloned().unwrap_or_default(),
                });
            }
            for to in targets {
                if to != END && !self.nodes.contains_key(to) {
                    return Err(GraphError::DanglingEdge {
                        from: from.clone(),
                        to: to.clone(),
                    });
                }
            }
        }

        for (from, edge) in &self.conditional_edges {
            if !self.nodes.contains_key(from) {
                return Err(GraphError::DanglingEdge {
                    from: from.clone(),
                    to: "<conditional>".to_string(),
                });
            }
            for (label, target) in edge.path_map() {
                if target != END && !self.nodes.contains_key(target) {
                    return Err(GraphError::DanglingConditionalTarget {
                        from: from.clone(),
                        label: label.clone(),
                        target: target.clone(),
                    });
                }
            }
        }

        for (id, (_, options)) in &self.nodes {
            for target in &options.destinations {
                if target != END && !self.nodes.contains_key(target) {
                    return Err(GraphError::DanglingEdge {
                        from: id.clone(),
                        to: target.clone(),
                    });
                }
            }
        }

        self.check_reachability(&entry_point)?;

        // Routing metadata: a static edge from -> to materializes the
        // `branch:to:<to>` channel; every node is fired by its own branch
        // and trigger channels.
        let mut writers: FxHashMap<String, Vec<String>> = FxHashMap::default();
        for (from, targets) in &self.edges {
            if from == START {
                continue;
            }
            let entry = writers.entry(from.clone()).or_default();
            for to in targets {
                if to != END {
                    entry.push(branch_channel(to));
                }
            }
        }

        let mut trigger_map: FxHashMap<String, Vec<String>> = FxHashMap::default();
        let mut nodes: FxHashMap<String, Arc<NodeEntry>> = FxHashMap::default();
        for (id, (function, options)) in self.nodes {
            let triggers = vec![branch_channel(&id), trigger_channel(&id)];
            for channel in &triggers {
                trigger_map
                    .entry(channel.clone())
                    .or_default()
                    .push(id.clone());
            }
            let entry = NodeEntry {
                name: options.name.unwrap_or_else(|| id.clone()),
                node_type: options.node_type,
                function,
                writers: writers.remove(&id).unwrap_or_default(),
                triggers,
                callbacks: options.callbacks,
                retry_policies: options.retry_policies,
                cache_policy: options.cache_policy,
                cache_key_selector: options.cache_key_selector,
                destinations: options.destinations,
                interrupt_before: options.interrupt_before,
                interrupt_after: options.interrupt_after,
                id: id.clone(),
            };
            nodes.insert(id, Arc::new(entry));
        }

        Ok(Graph {
            nodes,
            edges: self.edges,
            conditional_edges: self.conditional_edges,
            entry_point,
            trigger_map,
            schema: self.schema,
            cache: self.cache,
            callbacks: self.callbacks,
            default_retry_policies: self.default_retry_policies,
            default_cache_policy: self.default_cache_policy,
            interrupt_before: self.interrupt_before,
            interrupt_after: self.interrupt_after,
        })
    }

    /// Breadth-first reachability over static edges, conditional path maps,
    /// and declared destinations, rooted at the entry point and any
    /// `__start__` edges.
    fn check_reachability(&self, entry_point: &str) -> Result<(), GraphError> {
        let mut seen: FxHashSet<&str> = FxHashSet::default();
        let mut queue: VecDeque<&str> = VecDeque::new();

        seen.insert(entry_point);
        queue.push_back(entry_point);
        if let Some(starts) = self.edges.get(START) {
            for target in starts {
                if target != END && seen.insert(target.as_str()) {
                    queue.push_back(target.as_str());
                }
            }
        }

        while let Some(current) = queue.pop_front() {
            if let Some(targets) = self.edges.get(current) {
                for target in targets {
                    if target != END && seen.insert(target.as_str()) {
                        queue.push_back(target.as_str());
                    }
                }
            }
            if let Some(edge) = self.conditional_edges.get(current) {
                for target in edge.path_map().values() {
                    if target != END && seen.insert(target.as_str()) {
                        queue.push_back(target.as_str());
                    }
                }
            }
            if let Some((_, options)) = self.nodes.get(current) {
                for target in &options.destinations {
                    if target != END && seen.insert(target.as_str()) {
                        queue.push_back(target.as_str());
                    }
                }
            }
        }

        for id in self.nodes.keys() {
            if !seen.contains(id.as_str()) {
                return Err(GraphError::Unreachable { id: id.clone() });
            }
        }
        Ok(())
    }
}
