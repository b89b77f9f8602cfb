//! Core identifiers for the graphflow runtime.
//!
//! This module defines the fundamental naming conventions used throughout the
//! system: node identifiers (including the virtual `__start__`/`__end__`
//! endpoints), the channel name grammar, and the reserved state keys the
//! engine uses to carry control data through a run.
//!
//! For runtime execution types (invocations, checkpoints), see
//! [`crate::runtime`].
//!
//! # Channel naming
//!
//! Channels are addressed by plain strings with three recognised prefixes:
//!
//! - `input:<key>` — seeded from the initial state, one per state key
//! - `branch:to:<node>` — created by static or conditional edges to route to
//!   a specific target
//! - `trigger:<node>` — created by a [`Command`](crate::command::Command)
//!   `goto` to force-trigger a target
//!
//! # Reserved state keys
//!
//! Keys starting with an underscore are internal; callers should not set
//! them. A subset of those keys is *unsafe*: they name engine handles that
//! are carried by reference on the task context and must never be
//! deep-copied or serialized.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Virtual entry node. Never executed; the entry point is a real node.
pub const START: &str = "__start__";

/// Virtual terminal node. A sink for edges; never executed.
pub const END: &str = "__end__";

/// Carries a caller-supplied [`Command`](crate::command::Command) into a run.
pub const KEY_COMMAND: &str = "__command__";
/// Direct resume value consumed by the next `suspend` call.
pub const KEY_RESUME: &str = "__resume__";
/// Keyed resume values consumed by matching `suspend` calls.
pub const KEY_RESUME_MAP: &str = "__resume_map__";
/// Planner seed written when resuming a checkpoint with an executable frontier.
pub const KEY_NEXT_NODES: &str = "__next_nodes__";
/// Execution context handle (unsafe, reference-carried).
pub const KEY_EXEC_CONTEXT: &str = "__exec_context__";
/// Identifier of the node currently executing (unsafe).
pub const KEY_CURRENT_NODE_ID: &str = "__current_node_id__";
/// Node callback table (unsafe).
pub const KEY_NODE_CALLBACKS: &str = "__node_callbacks__";
/// Tool callback table (unsafe).
pub const KEY_TOOL_CALLBACKS: &str = "__tool_callbacks__";
/// Model callback table (unsafe).
pub const KEY_MODEL_CALLBACKS: &str = "__model_callbacks__";
/// Agent callback table (unsafe).
pub const KEY_AGENT_CALLBACKS: &str = "__agent_callbacks__";
/// Session handle (unsafe).
pub const KEY_SESSION: &str = "__session__";
/// Parent agent handle (unsafe).
pub const KEY_PARENT_AGENT: &str = "__parent_agent__";
/// Conventional key for the user's input text.
pub const KEY_USER_INPUT: &str = "__user_input__";
/// Conventional key for the running message history.
pub const KEY_MESSAGES: &str = "__messages__";
/// Conventional key for the most recent model response.
pub const KEY_LAST_RESPONSE: &str = "__last_response__";
/// Conventional key for caller metadata.
pub const KEY_METADATA: &str = "__metadata__";

/// Keys that name engine handles. Never deep-copied into task inputs, never
/// serialized into checkpoints or completion snapshots.
pub const UNSAFE_KEYS: &[&str] = &[
    KEY_EXEC_CONTEXT,
    KEY_SESSION,
    KEY_NODE_CALLBACKS,
    KEY_TOOL_CALLBACKS,
    KEY_MODEL_CALLBACKS,
    KEY_AGENT_CALLBACKS,
    KEY_CURRENT_NODE_ID,
    KEY_PARENT_AGENT,
];

/// Returns `true` for internal (underscore-prefixed) keys.
///
/// Internal keys are skipped when merging caller-supplied initial values
/// into restored state on resume.
#[must_use]
pub fn is_internal_key(key: &str) -> bool {
    key.starts_with('_')
}

/// Returns `true` for keys that must be carried by reference only.
#[must_use]
pub fn is_unsafe_key(key: &str) -> bool {
    UNSAFE_KEYS.contains(&key)
}

/// Builds the `input:<key>` channel name for a state key.
#[must_use]
pub fn input_channel(key: &str) -> String {
    format!("input:{key}")
}

/// Builds the `branch:to:<node>` channel name routing to a target node.
#[must_use]
pub fn branch_channel(target: &str) -> String {
    format!("branch:to:{target}")
}

/// Builds the `trigger:<node>` channel name force-triggering a target node.
#[must_use]
pub fn trigger_channel(target: &str) -> String {
    format!("trigger:{target}")
}

/// Classifies the kind of a node function.
///
/// The runtime treats all kinds identically; the kind is carried on node
/// lifecycle events so consumers can distinguish plain functions from LLM,
/// tool, and sub-agent nodes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Plain computation node.
    #[default]
    Function,
    /// Model-backed node.
    Llm,
    /// Tool invocation node.
    Tool,
    /// Sub-agent / subgraph node.
    Agent,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Function => write!(f, "function"),
            Self::Llm => write!(f, "llm"),
            Self::Tool => write!(f, "tool"),
            Self::Agent => write!(f, "agent"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_name_grammar() {
        assert_eq!(input_channel("query"), "input:query");
        assert_eq!(branch_channel("worker"), "branch:to:worker");
        assert_eq!(trigger_channel("worker"), "trigger:worker");
    }

    #[test]
    fn key_classification() {
        assert!(is_internal_key(KEY_RESUME));
        assert!(is_internal_key("_private"));
        assert!(!is_internal_key("query"));

        assert!(is_unsafe_key(KEY_SESSION));
        assert!(is_unsafe_key(KEY_EXEC_CONTEXT));
        assert!(!is_unsafe_key(KEY_RESUME));
        assert!(!is_unsafe_key(KEY_MESSAGES));
    }
}
