//! Node execution primitives.
//!
//! A [`Node`] is an async unit of work. It receives a [`NodeContext`] and a
//! deep-copied snapshot of state, and returns a
//! [`NodeOutput`](crate::command::NodeOutput): a state delta, a routing
//! command, a fan-out list, or nothing. Concrete node implementations (LLM
//! adapters, tool invokers, sub-agent runners) live outside this crate; the
//! runtime only depends on this trait and the state-key conventions in
//! [`crate::types`].
//!
//! # Human-in-the-loop suspension
//!
//! A node pauses a run by calling [`NodeContext::suspend`]. If the engine
//! holds a resume value for the call it is returned immediately; otherwise
//! the call raises an interrupt that halts the run after an interrupt
//! checkpoint is persisted. Re-invoking the same lineage with a resume
//! command re-executes the node, and this time `suspend` returns the
//! supplied value.
//!
//! ```no_run
//! use graphflow::command::NodeOutput;
//! use graphflow::node::{FnNode, NodeError};
//! use graphflow::state::State;
//! use serde_json::json;
//!
//! let approval_gate = FnNode::new(|ctx, _state: State| async move {
//!     let approved = ctx.suspend("confirm", json!("approve?"))?;
//!     Ok(NodeOutput::update(State::new().with("approved", approved)))
//! });
//! # let _ = approval_gate;
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use miette::Diagnostic;
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;

use crate::command::NodeOutput;
use crate::events::{EventEmitter, ExecutionEvent};
use crate::runtime::interrupt::InterruptError;
use crate::state::State;
use crate::types::{KEY_RESUME, KEY_RESUME_MAP, NodeType};

/// An executable unit of work in the graph.
#[async_trait]
pub trait Node: Send + Sync {
    /// Runs the node against a snapshot of state.
    ///
    /// The snapshot is a deep copy; mutations to it are invisible to other
    /// tasks. Changes are communicated exclusively through the returned
    /// output.
    async fn run(&self, ctx: NodeContext, state: State) -> Result<NodeOutput, NodeError>;
}

type NodeFn =
    Arc<dyn Fn(NodeContext, State) -> BoxFuture<'static, Result<NodeOutput, NodeError>> + Send + Sync>;

/// Adapts an async closure into a [`Node`].
///
/// ```
/// use graphflow::command::NodeOutput;
/// use graphflow::node::FnNode;
/// use graphflow::state::State;
/// use serde_json::json;
///
/// let node = FnNode::new(|_ctx, state: State| async move {
///     let input = state.get_str("input").unwrap_or_default().to_string();
///     Ok(NodeOutput::update(
///         State::new().with("processed", json!(format!("Processed: {input}"))),
///     ))
/// });
/// # let _ = node;
/// ```
#[derive(Clone)]
pub struct FnNode {
    f: NodeFn,
}

impl FnNode {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(NodeContext, State) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<NodeOutput, NodeError>> + Send + 'static,
    {
        Self {
            f: Arc::new(move |ctx, state| Box::pin(f(ctx, state))),
        }
    }
}

#[async_trait]
impl Node for FnNode {
    async fn run(&self, ctx: NodeContext, state: State) -> Result<NodeOutput, NodeError> {
        (self.f)(ctx, state).await
    }
}

/// Per-task execution context handed to a node.
///
/// Carries the engine handles that never travel through state: the event
/// emitter and the lock-protected live state used by the suspend protocol.
#[derive(Clone)]
pub struct NodeContext {
    /// Identifier of the executing node.
    pub node_id: String,
    /// Kind of the executing node.
    pub node_type: NodeType,
    /// Superstep the task belongs to.
    pub step: i64,
    /// Unique identifier of this task.
    pub task_id: String,
    /// Hierarchical task path (parent tasks first).
    pub task_path: Vec<String>,
    /// Identifier of the surrounding invocation.
    pub invocation_id: String,
    /// Branch label for fan-out observability.
    pub branch: String,
    emitter: EventEmitter,
    live: Arc<RwLock<State>>,
}

impl NodeContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        node_id: String,
        node_type: NodeType,
        step: i64,
        task_id: String,
        task_path: Vec<String>,
        invocation_id: String,
        branch: String,
        emitter: EventEmitter,
        live: Arc<RwLock<State>>,
    ) -> Self {
        Self {
            node_id,
            node_type,
            step,
            task_id,
            task_path,
            invocation_id,
            branch,
            emitter,
            live,
        }
    }

    /// Emits an event onto the run's event channel. Emission never blocks;
    /// the event is dropped if the consumer has fallen behind.
    pub fn emit(&self, event: ExecutionEvent) {
        self.emitter.emit(event);
    }

    /// Pauses the run for human input, or returns the supplied resume value.
    ///
    /// Looks for a direct resume value under `__resume__`, then a keyed
    /// entry under `__resume_map__[key]`. A found value is removed from
    /// state and returned. Otherwise an [`InterruptError`] carrying `prompt`
    /// is raised; the engine persists an interrupt checkpoint whose frontier
    /// re-executes this node on resume.
    pub fn suspend(&self, key: impl Into<String>, prompt: Value) -> Result<Value, NodeError> {
        let key = key.into();
        let mut state = self.live.write();
        if let Some(value) = state.remove(KEY_RESUME) {
            return Ok(value);
        }
        if let Some(Value::Object(mut entries)) = state.get(KEY_RESUME_MAP).cloned() {
            if let Some(value) = entries.remove(&key) {
                state.insert(KEY_RESUME_MAP, Value::Object(entries));
                return Ok(value);
            }
        }
        Err(NodeError::Interrupt(InterruptError::new(key, prompt)))
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("node_id", &self.node_id)
            .field("node_type", &self.node_type)
            .field("step", &self.step)
            .field("task_id", &self.task_id)
            .field("branch", &self.branch)
            .finish_non_exhaustive()
    }
}

/// Errors raised during node execution.
///
/// [`NodeError::Interrupt`] is special: it is never wrapped by the engine,
/// never passed to retry policies, and callers can detect it with
/// [`is_interrupt`](Self::is_interrupt).
#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    /// Expected input data is missing from the state snapshot.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(graphflow::node::missing_input),
        help("Check that an upstream node produced the required key: {what}.")
    )]
    MissingInput { what: &'static str },

    /// Input validation failed.
    #[error("validation failed: {0}")]
    #[diagnostic(code(graphflow::node::validation))]
    ValidationFailed(String),

    /// The node function exceeded its timeout.
    #[error("node {node_id} timed out after {waited_ms}ms")]
    #[diagnostic(
        code(graphflow::node::timeout),
        help("Raise the node or step timeout, or split the work across steps.")
    )]
    Timeout { node_id: String, waited_ms: u128 },

    /// Generic execution failure reported by node code.
    #[error("node execution failed: {message}")]
    #[diagnostic(code(graphflow::node::execution))]
    Execution { message: String },

    /// A before/after callback failed, failing the task.
    #[error("{phase} callback failed: {message}")]
    #[diagnostic(code(graphflow::node::callback))]
    Callback {
        phase: &'static str,
        message: String,
    },

    /// A conditional edge predicate failed or routed nowhere.
    #[error("conditional edge evaluation failed: {message}")]
    #[diagnostic(code(graphflow::node::routing))]
    Routing { message: String },

    /// JSON (de)serialization error.
    #[error(transparent)]
    #[diagnostic(code(graphflow::node::serde_json))]
    Serde(#[from] serde_json::Error),

    /// The node function panicked; the payload is preserved as text.
    #[error("node panicked: {message}")]
    #[diagnostic(code(graphflow::node::panic))]
    Panic { message: String },

    /// Suspension request. Not a failure; see [`crate::runtime::interrupt`].
    #[error(transparent)]
    #[diagnostic(transparent)]
    Interrupt(#[from] InterruptError),
}

impl NodeError {
    /// Generic execution failure from anything displayable.
    pub fn execution(message: impl Into<String>) -> Self {
        NodeError::Execution {
            message: message.into(),
        }
    }

    /// Returns `true` for the interrupt kind, which bypasses retries and
    /// error events.
    #[must_use]
    pub fn is_interrupt(&self) -> bool {
        matches!(self, NodeError::Interrupt(_))
    }
}
