//! Node lifecycle callbacks.
//!
//! Callbacks observe and shape node execution without living inside node
//! code. Global (graph-level) and per-node sets are merged for each task:
//!
//! - **before**: global first, then per-node; the first hook returning a
//!   result short-circuits the node entirely.
//! - **after**: per-node first, then global, so per-node hooks can reshape
//!   the result before global observers see it. Each hook may override the
//!   result.
//! - **on_error**: global first, then per-node; observers only — they can
//!   never suppress the error.
//! - **agent events**: notified for node lifecycle events as they are
//!   emitted.

use std::sync::Arc;

use async_trait::async_trait;

use crate::command::NodeOutput;
use crate::events::ExecutionEvent;
use crate::node::NodeError;
use crate::state::State;
use crate::types::NodeType;

/// Identity of the node a callback fires for.
#[derive(Clone, Debug)]
pub struct CallbackContext {
    pub node_id: String,
    pub node_type: NodeType,
    pub step: i64,
    pub task_id: String,
    pub invocation_id: String,
}

/// Runs before the node function. Returning `Ok(Some(output))`
/// short-circuits the node: the output is treated as the node's result.
#[async_trait]
pub trait BeforeNodeHook: Send + Sync {
    async fn on_before(
        &self,
        ctx: &CallbackContext,
        state: &State,
    ) -> Result<Option<NodeOutput>, NodeError>;
}

/// Runs after the node function (or cache hit, or before-callback
/// short-circuit). Returning `Ok(Some(output))` replaces the result.
#[async_trait]
pub trait AfterNodeHook: Send + Sync {
    async fn on_after(
        &self,
        ctx: &CallbackContext,
        state: &State,
        result: &NodeOutput,
    ) -> Result<Option<NodeOutput>, NodeError>;
}

/// Observes node failures. Cannot suppress the error.
#[async_trait]
pub trait NodeErrorHook: Send + Sync {
    async fn on_error(&self, ctx: &CallbackContext, error: &NodeError);
}

/// Observes node lifecycle events.
#[async_trait]
pub trait AgentEventHook: Send + Sync {
    async fn on_event(&self, ctx: &CallbackContext, event: &ExecutionEvent);
}

struct BeforeFn<F>(F);

#[async_trait]
impl<F> BeforeNodeHook for BeforeFn<F>
where
    F: Fn(&CallbackContext, &State) -> Result<Option<NodeOutput>, NodeError> + Send + Sync,
{
    async fn on_before(
        &self,
        ctx: &CallbackContext,
        state: &State,
    ) -> Result<Option<NodeOutput>, NodeError> {
        (self.0)(ctx, state)
    }
}

struct AfterFn<F>(F);

#[async_trait]
impl<F> AfterNodeHook for AfterFn<F>
where
    F: Fn(&CallbackContext, &State, &NodeOutput) -> Result<Option<NodeOutput>, NodeError>
        + Send
        + Sync,
{
    async fn on_after(
        &self,
        ctx: &CallbackContext,
        state: &State,
        result: &NodeOutput,
    ) -> Result<Option<NodeOutput>, NodeError> {
        (self.0)(ctx, state, result)
    }
}

struct ErrorFn<F>(F);

#[async_trait]
impl<F> NodeErrorHook for ErrorFn<F>
where
    F: Fn(&CallbackContext, &NodeError) + Send + Sync,
{
    async fn on_error(&self, ctx: &CallbackContext, error: &NodeError) {
        (self.0)(ctx, error)
    }
}

/// An ordered set of lifecycle hooks.
#[derive(Clone, Default)]
pub struct NodeCallbacks {
    before: Vec<Arc<dyn BeforeNodeHook>>,
    after: Vec<Arc<dyn AfterNodeHook>>,
    on_error: Vec<Arc<dyn NodeErrorHook>>,
    agent_event: Vec<Arc<dyn AgentEventHook>>,
}

impl NodeCallbacks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a before hook from a closure.
    #[must_use]
    pub fn on_before<F>(mut self, f: F) -> Self
    where
        F: Fn(&CallbackContext, &State) -> Result<Option<NodeOutput>, NodeError>
            + Send
            + Sync
            + 'static,
    {
        self.before.push(Arc::new(BeforeFn(f)));
        self
    }

    /// Registers an after hook from a closure.
    #[must_use]
    pub fn on_after<F>(mut self, f: F) -> Self
    where
        F: Fn(&CallbackContext, &State, &NodeOutput) -> Result<Option<NodeOutput>, NodeError>
            + Send
            + Sync
            + 'static,
    {
        self.after.push(Arc::new(AfterFn(f)));
        self
    }

    /// Registers an error observer from a closure.
    #[must_use]
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&CallbackContext, &NodeError) + Send + Sync + 'static,
    {
        self.on_error.push(Arc::new(ErrorFn(f)));
        self
    }

    /// Registers a pre-built before hook.
    #[must_use]
    pub fn with_before_hook(mut self, hook: Arc<dyn BeforeNodeHook>) -> Self {
        self.before.push(hook);
        self
    }

    /// Registers a pre-built after hook.
    #[must_use]
    pub fn with_after_hook(mut self, hook: Arc<dyn AfterNodeHook>) -> Self {
        self.after.push(hook);
        self
    }

    /// Registers a pre-built error observer.
    #[must_use]
    pub fn with_error_hook(mut self, hook: Arc<dyn NodeErrorHook>) -> Self {
        self.on_error.push(hook);
        self
    }

    /// Registers an agent-event observer.
    #[must_use]
    pub fn with_agent_event_hook(mut self, hook: Arc<dyn AgentEventHook>) -> Self {
        self.agent_event.push(hook);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.before.is_empty()
            && self.after.is_empty()
            && self.on_error.is_empty()
            && self.agent_event.is_empty()
    }

    /// Merges global and per-node sets with the documented ordering.
    #[must_use]
    pub fn merged(global: &NodeCallbacks, node: &NodeCallbacks) -> NodeCallbacks {
        let mut before = global.before.clone();
        before.extend(node.before.iter().cloned());

        // Per-node after hooks run first so they can shape the result
        // before global observers.
        let mut after = node.after.clone();
        after.extend(global.after.iter().cloned());

        let mut on_error = global.on_error.clone();
        on_error.extend(node.on_error.iter().cloned());

        let mut agent_event = global.agent_event.clone();
        agent_event.extend(node.agent_event.iter().cloned());

        NodeCallbacks {
            before,
            after,
            on_error,
            agent_event,
        }
    }

    /// Runs before hooks in order; the first produced output short-circuits.
    pub async fn run_before(
        &self,
        ctx: &CallbackContext,
        state: &State,
    ) -> Result<Option<NodeOutput>, NodeError> {
        for hook in &self.before {
            if let Some(output) = hook.on_before(ctx, state).await? {
                return Ok(Some(output));
            }
        }
        Ok(None)
    }

    /// Runs after hooks in order, letting each override the result.
    pub async fn run_after(
        &self,
        ctx: &CallbackContext,
        state: &State,
        mut result: NodeOutput,
    ) -> Result<NodeOutput, NodeError> {
        for hook in &self.after {
            if let Some(output) = hook.on_after(ctx, state, &result).await? {
                result = output;
            }
        }
        Ok(result)
    }

    /// Notifies error observers. Observer panics or misbehavior never alter
    /// the error being propagated.
    pub async fn run_on_error(&self, ctx: &CallbackContext, error: &NodeError) {
        for hook in &self.on_error {
            hook.on_error(ctx, error).await;
        }
    }

    /// Notifies agent-event observers.
    pub async fn notify_event(&self, ctx: &CallbackContext, event: &ExecutionEvent) {
        for hook in &self.agent_event {
            hook.on_event(ctx, event).await;
        }
    }
}

impl std::fmt::Debug for NodeCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCallbacks")
            .field("before", &self.before.len())
            .field("after", &self.after.len())
            .field("on_error", &self.on_error.len())
            .field("agent_event", &self.agent_event.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> CallbackContext {
        CallbackContext {
            node_id: "n".into(),
            node_type: NodeType::Function,
            step: 0,
            task_id: "t".into(),
            invocation_id: "i".into(),
        }
    }

    #[tokio::test]
    async fn before_short_circuits_on_first_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let callbacks = NodeCallbacks::new()
            .on_before(move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(Some(NodeOutput::update(
                    State::new().with("short", json!(true)),
                )))
            })
            .on_before(|_, _| panic!("must not run"));

        let out = callbacks.run_before(&ctx(), &State::new()).await.unwrap();
        assert!(matches!(out, Some(NodeOutput::Update(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn merged_after_runs_node_hooks_before_global() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let o1 = order.clone();
        let global = NodeCallbacks::new().on_after(move |_, _, _| {
            o1.lock().push("global");
            Ok(None)
        });
        let o2 = order.clone();
        let node = NodeCallbacks::new().on_after(move |_, _, _| {
            o2.lock().push("node");
            Ok(None)
        });

        let merged = NodeCallbacks::merged(&global, &node);
        merged
            .run_after(&ctx(), &State::new(), NodeOutput::None)
            .await
            .unwrap();
        assert_eq!(*order.lock(), vec!["node", "global"]);
    }

    #[tokio::test]
    async fn after_hooks_can_override_result() {
        let callbacks = NodeCallbacks::new().on_after(|_, _, result| {
            if matches!(result, NodeOutput::None) {
                Ok(Some(NodeOutput::update(
                    State::new().with("overridden", json!(1)),
                )))
            } else {
                Ok(None)
            }
        });
        let out = callbacks
            .run_after(&ctx(), &State::new(), NodeOutput::None)
            .await
            .unwrap();
        assert!(matches!(out, NodeOutput::Update(_)));
    }
}
