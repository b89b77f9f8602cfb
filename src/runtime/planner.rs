//! Step planning: which nodes run next.
//!
//! Precedence, highest first:
//!
//! 1. A `__next_nodes__` seed left in state by checkpoint restoration.
//! 2. Pending fan-out tasks queued by command lists in earlier steps.
//! 3. Entry-point seeding at step 0 of a fresh run.
//! 4. Version-based triggering for resumed runs: a node fires when an
//!    available channel's version exceeds what the node last saw (or it
//!    never saw the channel). All available channels are acknowledged after
//!    planning.
//! 5. Availability-based triggering otherwise: every available trigger
//!    channel schedules its nodes and is acknowledged.

use serde_json::Value;

use crate::graph::Graph;
use crate::runtime::context::{ExecutionContext, PendingTask};
use crate::state::State;
use crate::types::KEY_NEXT_NODES;

/// One unit of work selected for a step.
#[derive(Clone, Debug)]
pub(crate) struct PlannedTask {
    pub node_id: String,
    /// Branch-local state for fan-out tasks.
    pub overlay: Option<State>,
    /// Branch label override for fan-out tasks.
    pub branch: Option<String>,
    /// Hierarchical task path accumulated across fan-outs.
    pub path: Vec<String>,
}

impl PlannedTask {
    fn plain(node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        Self {
            path: vec![node_id.clone()],
            node_id,
            overlay: None,
            branch: None,
        }
    }
}

impl From<PendingTask> for PlannedTask {
    fn from(task: PendingTask) -> Self {
        Self {
            node_id: task.target,
            overlay: task.overlay,
            branch: Some(task.branch),
            path: task.path,
        }
    }
}

/// Selects the task set for `step`.
pub(crate) fn plan_step(
    graph: &Graph,
    exec: &ExecutionContext,
    step: i64,
    resumed: bool,
) -> Vec<PlannedTask> {
    // Frontier restored from a checkpoint wins over everything.
    if let Some(value) = exec.take_value(KEY_NEXT_NODES) {
        let nodes = decode_node_list(&value);
        let tasks: Vec<PlannedTask> = nodes
            .into_iter()
            .filter(|id| graph.node(id).is_some())
            .map(PlannedTask::plain)
            .collect();
        if !tasks.is_empty() {
            return tasks;
        }
    }

    let queued = exec.drain_pending_tasks();
    if !queued.is_empty() {
        return queued.into_iter().map(PlannedTask::from).collect();
    }

    if step == 0 && !resumed {
        return vec![PlannedTask::plain(graph.entry_point())];
    }

    if resumed {
        plan_by_versions(graph, exec)
    } else {
        plan_by_availability(graph, exec)
    }
}

fn decode_node_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        Value::String(single) => vec![single.clone()],
        _ => Vec::new(),
    }
}

fn plan_by_versions(graph: &Graph, exec: &ExecutionContext) -> Vec<PlannedTask> {
    let available = exec.channels().available();
    let mut tasks: Vec<PlannedTask> = Vec::new();
    for channel in &available {
        let version = channel.version();
        for node_id in graph.triggered_nodes(channel.name()) {
            let unseen = exec
                .last_seen(node_id, channel.name())
                .is_none_or(|seen| version > seen);
            if unseen {
                if !tasks.iter().any(|t| t.node_id == *node_id) {
                    tasks.push(PlannedTask::plain(node_id));
                }
                exec.mark_seen(node_id, channel.name(), version);
            }
        }
    }
    for channel in &available {
        channel.acknowledge();
    }
    tasks
}

fn plan_by_availability(graph: &Graph, exec: &ExecutionContext) -> Vec<PlannedTask> {
    let mut tasks: Vec<PlannedTask> = Vec::new();
    for channel in exec.channels().available() {
        let triggered = graph.triggered_nodes(channel.name());
        if triggered.is_empty() {
            continue;
        }
        let version = channel.version();
        for node_id in triggered {
            if !tasks.iter().any(|t| t.node_id == *node_id) {
                tasks.push(PlannedTask::plain(node_id));
            }
            exec.mark_seen(node_id, channel.name(), version);
        }
        channel.acknowledge();
    }
    tasks
}

/// Dry-run of version-based triggering against the current channel state,
/// used to record `next_nodes`/`next_channels` on checkpoints without
/// consuming availability or touching versions-seen.
pub(crate) fn peek_frontier(graph: &Graph, exec: &ExecutionContext) -> (Vec<String>, Vec<String>) {
    let mut next_nodes: Vec<String> = Vec::new();
    let mut next_channels: Vec<String> = Vec::new();
    for channel in exec.channels().available() {
        let version = channel.version();
        let mut feeds_frontier = false;
        for node_id in graph.triggered_nodes(channel.name()) {
            let unseen = exec
                .last_seen(node_id, channel.name())
                .is_none_or(|seen| version > seen);
            if unseen {
                feeds_frontier = true;
                if !next_nodes.contains(node_id) {
                    next_nodes.push(node_id.clone());
                }
            }
        }
        if feeds_frontier {
            next_channels.push(channel.name().to_string());
        }
    }
    next_nodes.sort();
    next_channels.sort();
    (next_nodes, next_channels)
}
