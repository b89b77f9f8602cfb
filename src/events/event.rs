//! Typed event records emitted during a run.

use std::fmt;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channels::ChannelBehavior;
use crate::types::NodeType;

/// Phase of a superstep.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Planning,
    Execution,
    Update,
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Planning => write!(f, "planning"),
            Self::Execution => write!(f, "execution"),
            Self::Update => write!(f, "update"),
        }
    }
}

/// Progress of one superstep phase.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepEvent {
    pub phase: StepPhase,
    pub step: i64,
    pub task_count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub active_nodes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updated_channels: Vec<String>,
}

/// Terminal failure of a run. `step` is `-1` for executor-level failures
/// outside any step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub step: i64,
    pub error: String,
}

/// A run paused for human input.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InterruptEvent {
    pub step: i64,
    pub node_id: String,
    pub value: Value,
}

/// Shared body of the node lifecycle events.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeEvent {
    pub node_id: String,
    pub node_type: NodeType,
    pub step: i64,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Delay before the next attempt, set on retrying errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_delay_ms: Option<u64>,
    #[serde(default)]
    pub retrying: bool,
    #[serde(default)]
    pub cache_hit: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NodeEvent {
    /// Body for a `NodeStart` with the fields known at start time.
    #[must_use]
    pub fn start(
        node_id: impl Into<String>,
        node_type: NodeType,
        step: i64,
        attempt: u32,
        max_attempts: Option<u32>,
        input_keys: Vec<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_type,
            step,
            start_time: Utc::now(),
            end_time: None,
            attempt: Some(attempt),
            max_attempts,
            next_delay_ms: None,
            retrying: false,
            cache_hit: false,
            input_keys,
            output_keys: Vec::new(),
            error: None,
        }
    }

    /// Derives a completion body from a start body.
    #[must_use]
    pub fn completed(mut self, output_keys: Vec<String>, cache_hit: bool) -> Self {
        self.end_time = Some(Utc::now());
        self.output_keys = output_keys;
        self.cache_hit = cache_hit;
        self
    }

    /// Derives a failure body from a start body.
    #[must_use]
    pub fn failed(mut self, error: impl fmt::Display, retrying: bool, next_delay_ms: Option<u64>) -> Self {
        self.end_time = Some(Utc::now());
        self.error = Some(error.to_string());
        self.retrying = retrying;
        self.next_delay_ms = next_delay_ms;
        self
    }
}

/// A channel publication during the update phase.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelUpdateEvent {
    pub name: String,
    pub behavior: ChannelBehavior,
    pub available: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub triggered_nodes: Vec<String>,
}

/// State keys written during the update phase.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StateUpdateEvent {
    pub updated_keys: Vec<String>,
    pub state_size: usize,
}

/// Terminal success of a run, carrying a JSON-serializable snapshot of the
/// final state keyed by state key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GraphCompletion {
    pub state_delta: FxHashMap<String, Value>,
    pub total_steps: i64,
    pub total_duration_ms: u64,
}

/// Every event the runtime can emit.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    Step(StepEvent),
    Error(ErrorEvent),
    Interrupt(InterruptEvent),
    NodeStart(NodeEvent),
    NodeComplete(NodeEvent),
    NodeError(NodeEvent),
    ChannelUpdate(ChannelUpdateEvent),
    StateUpdate(StateUpdateEvent),
    Completion(GraphCompletion),
}

impl ExecutionEvent {
    /// Structured JSON rendering for sinks and transports.
    #[must_use]
    pub fn to_json_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionEvent::Completion(_) | ExecutionEvent::Error(_) | ExecutionEvent::Interrupt(_)
        )
    }
}

impl fmt::Display for ExecutionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionEvent::Step(e) => write!(
                f,
                "[step {}] {} ({} tasks)",
                e.step, e.phase, e.task_count
            ),
            ExecutionEvent::Error(e) => write!(f, "[step {}] error: {}", e.step, e.error),
            ExecutionEvent::Interrupt(e) => {
                write!(f, "[step {}] interrupt at {}: {}", e.step, e.node_id, e.value)
            }
            ExecutionEvent::NodeStart(e) => match e.attempt {
                Some(attempt) => write!(f, "[{}@{}] start (attempt {attempt})", e.node_id, e.step),
                None => write!(f, "[{}@{}] start", e.node_id, e.step),
            },
            ExecutionEvent::NodeComplete(e) => {
                if e.cache_hit {
                    write!(f, "[{}@{}] complete (cached)", e.node_id, e.step)
                } else {
                    write!(f, "[{}@{}] complete", e.node_id, e.step)
                }
            }
            ExecutionEvent::NodeError(e) => write!(
                f,
                "[{}@{}] error: {}{}",
                e.node_id,
                e.step,
                e.error.as_deref().unwrap_or("unknown"),
                if e.retrying { " (retrying)" } else { "" }
            ),
            ExecutionEvent::ChannelUpdate(e) => write!(f, "channel {} updated", e.name),
            ExecutionEvent::StateUpdate(e) => {
                write!(f, "state updated: {} keys", e.updated_keys.len())
            }
            ExecutionEvent::Completion(e) => write!(
                f,
                "completed in {} steps ({}ms)",
                e.total_steps, e.total_duration_ms
            ),
        }
    }
}
