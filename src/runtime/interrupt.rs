//! Interrupt protocol: suspension as an error kind, not a language feature.
//!
//! A dynamic interrupt starts life as an [`InterruptError`] raised by
//! [`NodeContext::suspend`](crate::node::NodeContext::suspend). The engine
//! enriches it with node, task, step, and path metadata, emits an interrupt
//! event, persists an interrupt checkpoint whose frontier re-executes the
//! suspended node, and ends the run without a generic error event.
//!
//! Static interrupt points (declared before/after a node at graph build
//! time) produce the same checkpoint shape; their [`InterruptState`] marks
//! the phase in its path.
//!
//! Interrupt errors are never wrapped and never retried; callers detect
//! them with [`NodeError::is_interrupt`](crate::node::NodeError::is_interrupt).

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Path segment marking a static before-node interrupt.
pub const STATIC_BEFORE: &str = "static:before";
/// Path segment marking a static after-node interrupt.
pub const STATIC_AFTER: &str = "static:after";

/// A suspension request travelling up from a node.
///
/// `value` is the prompt handed to the caller (for a dynamic interrupt, the
/// second argument of `suspend`). The remaining fields are attached by the
/// engine before the error reaches the BSP loop.
#[derive(Clone, Debug, Error, Diagnostic, Serialize, Deserialize)]
#[error("node suspended awaiting external input: {value}")]
#[diagnostic(
    code(graphflow::interrupt::suspended),
    help("Re-invoke the same lineage with Command::resume(..) or Command::resume_map(..) to continue.")
)]
pub struct InterruptError {
    /// Resume key the suspending call will look up on re-execution.
    pub key: String,
    /// Prompt surfaced to the caller.
    pub value: Value,
    pub node_id: Option<String>,
    pub task_id: Option<String>,
    pub step: Option<i64>,
    #[serde(default)]
    pub path: Vec<String>,
}

impl InterruptError {
    #[must_use]
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
            node_id: None,
            task_id: None,
            step: None,
            path: Vec::new(),
        }
    }

    /// Attaches execution metadata; called by the engine on the way up.
    #[must_use]
    pub(crate) fn enriched(
        mut self,
        node_id: impl Into<String>,
        task_id: impl Into<String>,
        step: i64,
        path: Vec<String>,
    ) -> Self {
        self.node_id = Some(node_id.into());
        self.task_id = Some(task_id.into());
        self.step = Some(step);
        self.path = path;
        self
    }

    /// The persisted form carried on interrupt checkpoints.
    #[must_use]
    pub fn to_state(&self) -> InterruptState {
        InterruptState {
            node_id: self.node_id.clone().unwrap_or_default(),
            task_id: self.task_id.clone().unwrap_or_default(),
            value: self.value.clone(),
            step: self.step.unwrap_or(-1),
            path: self.path.clone(),
        }
    }
}

/// Where and why a run was interrupted, persisted on the checkpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterruptState {
    pub node_id: String,
    pub task_id: String,
    pub value: Value,
    pub step: i64,
    #[serde(default)]
    pub path: Vec<String>,
}

impl InterruptState {
    /// Builds the state for a static interrupt point.
    #[must_use]
    pub fn static_point(node_id: impl Into<String>, step: i64, phase: &str) -> Self {
        Self {
            node_id: node_id.into(),
            task_id: String::new(),
            value: Value::Null,
            step,
            path: vec![phase.to_string()],
        }
    }

    /// Whether this records a static (declared) interrupt point.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.path
            .iter()
            .any(|p| p == STATIC_BEFORE || p == STATIC_AFTER)
    }
}
