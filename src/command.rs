//! Control-flow values returned by nodes.
//!
//! Routing intent is kept separate from state mutation: a node returns a
//! [`NodeOutput`] that either carries a plain state delta, a single
//! [`Command`] (optional update plus optional `goto` target), a list of
//! commands (fan-out), or nothing. The executor reconciles these with the
//! graph's static and conditional edges.
//!
//! Commands are also the resume vehicle: a caller re-invoking an
//! interrupted lineage places `Command::resume(..)` or
//! `Command::resume_map(..)` in the initial state under
//! [`KEY_COMMAND`](crate::types::KEY_COMMAND).

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::State;

/// A routing/update directive returned by a node or supplied by a caller.
///
/// # Examples
///
/// ```
/// use graphflow::command::Command;
/// use graphflow::state::State;
/// use serde_json::json;
///
/// // Update state and force-trigger a target node.
/// let cmd = Command::new()
///     .with_update(State::new().with("route_taken", json!("long_path")))
///     .with_goto("long_process");
/// assert_eq!(cmd.goto.as_deref(), Some("long_process"));
///
/// // Resume an interrupted run.
/// let resume = Command::resume_map([("confirm".to_string(), json!(true))]);
/// assert!(resume.resume_map.is_some());
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// State delta to merge through the schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<State>,
    /// Target node to force-trigger via its `trigger:<node>` channel. When
    /// set, the originating node's static writers are skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goto: Option<String>,
    /// Direct resume value for the next `suspend` call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<Value>,
    /// Keyed resume values for matching `suspend` calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_map: Option<FxHashMap<String, Value>>,
}

impl Command {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the state delta carried by this command.
    #[must_use]
    pub fn with_update(mut self, update: State) -> Self {
        self.update = Some(update);
        self
    }

    /// Sets the force-trigger target.
    #[must_use]
    pub fn with_goto(mut self, target: impl Into<String>) -> Self {
        self.goto = Some(target.into());
        self
    }

    /// Shorthand for a command that only routes.
    #[must_use]
    pub fn goto(target: impl Into<String>) -> Self {
        Self::new().with_goto(target)
    }

    /// A resume command carrying a single direct value.
    #[must_use]
    pub fn resume(value: Value) -> Self {
        Self {
            resume: Some(value),
            ..Self::default()
        }
    }

    /// A resume command carrying keyed values.
    #[must_use]
    pub fn resume_map(entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            resume_map: Some(entries.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Returns `true` when the command carries nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.update.is_none()
            && self.goto.is_none()
            && self.resume.is_none()
            && self.resume_map.is_none()
    }
}

/// What a node execution produced.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum NodeOutput {
    /// Nothing; static edge writes still run so downstream nodes schedule.
    #[default]
    None,
    /// A state delta merged through the schema reducers.
    Update(State),
    /// A single routing command.
    Command(Command),
    /// Fan-out: each command becomes an independent task in a later step.
    Commands(Vec<Command>),
}

impl NodeOutput {
    /// Wraps a state delta.
    #[must_use]
    pub fn update(state: State) -> Self {
        NodeOutput::Update(state)
    }

    /// Returns `true` when this output routes explicitly (single `goto` or
    /// fan-out), which suppresses static edge writes.
    #[must_use]
    pub fn routes_explicitly(&self) -> bool {
        match self {
            NodeOutput::Command(cmd) => cmd.goto.is_some(),
            NodeOutput::Commands(_) => true,
            _ => false,
        }
    }
}

impl From<State> for NodeOutput {
    fn from(state: State) -> Self {
        NodeOutput::Update(state)
    }
}

impl From<Command> for NodeOutput {
    fn from(command: Command) -> Self {
        NodeOutput::Command(command)
    }
}

impl From<Vec<Command>> for NodeOutput {
    fn from(commands: Vec<Command>) -> Self {
        NodeOutput::Commands(commands)
    }
}
