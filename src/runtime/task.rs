//! The single-task execution pipeline.
//!
//! One invocation of [`run_task`] drives a node through its full lifecycle:
//! start event, before callbacks (which may short-circuit), cache lookup,
//! the node function under its timeout, after callbacks, result handling
//! (state merge, channel writes, fan-out enqueue, conditional edges), cache
//! store, and retries with backoff. Interrupt errors skip retries and error
//! events entirely; they are enriched with task metadata and propagated to
//! the BSP loop.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde_json::Value;
use tokio::time::Instant;

use crate::cache::node_namespace;
use crate::callbacks::{CallbackContext, NodeCallbacks};
use crate::command::NodeOutput;
use crate::events::{ExecutionEvent, NodeEvent};
use crate::graph::{Graph, NodeEntry};
use crate::node::{NodeContext, NodeError};
use crate::retry::first_matching;
use crate::runtime::config::Invocation;
use crate::runtime::context::{ExecutionContext, PendingTask};
use crate::state::State;
use crate::types::{branch_channel, trigger_channel, END};

/// Immutable inputs shared by every task of a step.
pub(crate) struct TaskEnv {
    pub graph: Arc<Graph>,
    pub exec: Arc<ExecutionContext>,
    pub invocation: Invocation,
    pub step: i64,
    pub step_deadline: Option<Instant>,
    pub node_timeout: Option<Duration>,
}

/// One task: a node plus its snapshot input and identity.
pub(crate) struct TaskSpec {
    pub node: Arc<NodeEntry>,
    pub task_id: String,
    pub path: Vec<String>,
    pub branch: String,
    /// Deep copy of state at task start, overlay already merged.
    pub input: State,
}

/// Renders a panic payload as text.
pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Runs one task to completion, retrying per the node's policies.
pub(crate) async fn run_task(env: &TaskEnv, spec: &TaskSpec) -> Result<(), NodeError> {
    let node = &spec.node;
    let callbacks = NodeCallbacks::merged(env.graph.callbacks(), &node.callbacks);
    let cb_ctx = CallbackContext {
        node_id: node.id.clone(),
        node_type: node.node_type,
        step: env.step,
        task_id: spec.task_id.clone(),
        invocation_id: env.invocation.invocation_id.clone(),
    };
    let policies = env.graph.effective_retry_policies(node);
    let max_attempts_hint = policies.first().map(|p| p.max_attempts);
    let mut input_keys: Vec<String> = spec.input.keys().cloned().collect();
    input_keys.sort();

    let task_started = Instant::now();
    let mut attempt: u32 = 1;
    loop {
        let start_body = NodeEvent::start(
            &node.id,
            node.node_type,
            env.step,
            attempt,
            max_attempts_hint,
            input_keys.clone(),
        );
        let start_event = ExecutionEvent::NodeStart(start_body.clone());
        env.exec.emitter().emit(start_event.clone());
        callbacks.notify_event(&cb_ctx, &start_event).await;

        match attempt_once(env, spec, &callbacks, &cb_ctx).await {
            Ok((output_keys, cache_hit)) => {
                let complete =
                    ExecutionEvent::NodeComplete(start_body.completed(output_keys, cache_hit));
                env.exec.emitter().emit(complete.clone());
                callbacks.notify_event(&cb_ctx, &complete).await;
                return Ok(());
            }
            Err(NodeError::Interrupt(interrupt)) => {
                // Interrupts bypass retries and error events; metadata is
                // attached here and the BSP loop takes over.
                return Err(NodeError::Interrupt(interrupt.enriched(
                    &node.id,
                    &spec.task_id,
                    env.step,
                    spec.path.clone(),
                )));
            }
            Err(error) => {
                callbacks.run_on_error(&cb_ctx, &error).await;

                let Some(policy) = first_matching(policies, &error) else {
                    let failed = ExecutionEvent::NodeError(start_body.failed(&error, false, None));
                    env.exec.emitter().emit(failed.clone());
                    callbacks.notify_event(&cb_ctx, &failed).await;
                    return Err(error);
                };

                let budget_left = attempt < policy.max_attempts
                    && task_started.elapsed() < policy.max_elapsed;
                if !budget_left {
                    let failed = ExecutionEvent::NodeError(start_body.failed(&error, false, None));
                    env.exec.emitter().emit(failed.clone());
                    callbacks.notify_event(&cb_ctx, &failed).await;
                    return Err(NodeError::execution(format!(
                        "node {} execution failed after {attempt} attempts: {error}",
                        node.id
                    )));
                }

                let delay = policy.next_delay(attempt);
                if let Some(deadline) = env.step_deadline {
                    if Instant::now() + delay >= deadline {
                        // Sleeping would overshoot the step deadline.
                        let failed =
                            ExecutionEvent::NodeError(start_body.failed(&error, false, None));
                        env.exec.emitter().emit(failed);
                        return Err(error);
                    }
                }

                let retrying = ExecutionEvent::NodeError(start_body.failed(
                    &error,
                    true,
                    Some(delay.as_millis() as u64),
                ));
                env.exec.emitter().emit(retrying.clone());
                callbacks.notify_event(&cb_ctx, &retrying).await;

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// One attempt: callbacks, cache, node function, result handling.
/// Returns the output keys written and whether the result came from cache.
async fn attempt_once(
    env: &TaskEnv,
    spec: &TaskSpec,
    callbacks: &NodeCallbacks,
    cb_ctx: &CallbackContext,
) -> Result<(Vec<String>, bool), NodeError> {
    // A before callback may stand in for the node entirely.
    if let Some(result) = callbacks.run_before(cb_ctx, &spec.input).await? {
        let output_keys = handle_result(env, spec, result).await?;
        return Ok((output_keys, false));
    }

    let cache = env.graph.cache();
    let policy = env.graph.effective_cache_policy(&spec.node);
    let mut cache_slot: Option<(String, Vec<u8>)> = None;
    if let (Some(cache), Some(policy)) = (cache, policy) {
        match compute_cache_key(spec, policy) {
            Ok(key) => {
                let namespace = node_namespace(&spec.node.id);
                match cache.get(&namespace, &key).await {
                    Ok(Some(stored)) => {
                        if let Ok(output) = serde_json::from_value::<NodeOutput>(stored) {
                            let output = callbacks.run_after(cb_ctx, &spec.input, output).await?;
                            let output_keys = handle_result(env, spec, output).await?;
                            return Ok((output_keys, true));
                        }
                        // Undecodable entry: fall through and recompute.
                        cache_slot = Some((namespace, key));
                    }
                    Ok(None) => cache_slot = Some((namespace, key)),
                    Err(error) => {
                        tracing::debug!(node = %spec.node.id, error = %error, "cache lookup failed");
                        cache_slot = Some((namespace, key));
                    }
                }
            }
            Err(error) => {
                tracing::debug!(node = %spec.node.id, error = %error, "cache key computation failed; bypassing cache");
            }
        }
    }

    let ctx = NodeContext::new(
        spec.node.id.clone(),
        spec.node.node_type,
        env.step,
        spec.task_id.clone(),
        spec.path.clone(),
        env.invocation.invocation_id.clone(),
        spec.branch.clone(),
        env.exec.emitter().clone(),
        env.exec.live_state(),
    );

    let invocation = AssertUnwindSafe(spec.node.function.run(ctx, spec.input.clone())).catch_unwind();
    let outcome = match env.node_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, invocation).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(NodeError::Timeout {
                    node_id: spec.node.id.clone(),
                    waited_ms: timeout.as_millis(),
                });
            }
        },
        None => invocation.await,
    };
    let output = match outcome {
        Ok(Ok(output)) => output,
        Ok(Err(error)) => return Err(error),
        Err(payload) => {
            return Err(NodeError::Panic {
                message: panic_message(payload),
            });
        }
    };

    // Per-node after hooks run first, then global observers.
    let output = callbacks.run_after(cb_ctx, &spec.input, output).await?;

    if let (Some((namespace, key)), Some(cache), Some(policy)) = (cache_slot, cache, policy) {
        match serde_json::to_value(&output) {
            Ok(stored) => {
                if let Err(error) = cache.set(&namespace, &key, stored, policy.ttl).await {
                    tracing::debug!(node = %spec.node.id, error = %error, "cache store failed");
                }
            }
            Err(error) => {
                tracing::debug!(node = %spec.node.id, error = %error, "cache store skipped: unserializable output");
            }
        }
    }

    let output_keys = handle_result(env, spec, output).await?;
    Ok((output_keys, false))
}

fn compute_cache_key(
    spec: &TaskSpec,
    policy: &crate::cache::CachePolicy,
) -> Result<Vec<u8>, crate::cache::CacheError> {
    match &spec.node.cache_key_selector {
        Some(selector) => Ok(serde_json::to_vec(&selector(&spec.input))?),
        None => policy.key(&spec.input),
    }
}

/// Applies a node's output: state merge, channel writes, fan-out enqueue,
/// and conditional edge routing.
async fn handle_result(
    env: &TaskEnv,
    spec: &TaskSpec,
    output: NodeOutput,
) -> Result<Vec<String>, NodeError> {
    let schema = env.graph.schema();
    let routed = output.routes_explicitly();
    let mut output_keys: Vec<String> = Vec::new();

    match output {
        NodeOutput::None => static_writes(env, spec),
        NodeOutput::Update(delta) => {
            output_keys = env.exec.apply_update(schema, delta);
            static_writes(env, spec);
        }
        NodeOutput::Command(command) => {
            if let Some(update) = command.update {
                output_keys = env.exec.apply_update(schema, update);
            }
            match command.goto {
                Some(target) => {
                    validate_target(&env.graph, &spec.node.id, &target)?;
                    if target != END {
                        env.exec.record_write(
                            trigger_channel(&target),
                            Value::Null,
                            &spec.task_id,
                        );
                    }
                }
                None => static_writes(env, spec),
            }
        }
        NodeOutput::Commands(commands) => {
            for (index, command) in commands.into_iter().enumerate() {
                let target = command.goto.ok_or_else(|| NodeError::Routing {
                    message: format!(
                        "fan-out command {index} from '{}' has no goto target",
                        spec.node.id
                    ),
                })?;
                validate_target(&env.graph, &spec.node.id, &target)?;
                let mut path = spec.path.clone();
                path.push(target.clone());
                env.exec.enqueue_task(PendingTask {
                    branch: env.invocation.child_branch(&spec.node.id, index),
                    overlay: command.update,
                    target,
                    path,
                });
            }
        }
    }

    if !routed {
        if let Some(edge) = env.graph.conditional_edge(&spec.node.id) {
            let snapshot = env.exec.snapshot();
            let target = edge.resolve(&snapshot)?;
            if target != END {
                validate_target(&env.graph, &spec.node.id, &target)?;
                env.exec
                    .record_write(branch_channel(&target), Value::Null, &spec.task_id);
            }
        }
    }

    Ok(output_keys)
}

fn static_writes(env: &TaskEnv, spec: &TaskSpec) {
    for channel in &spec.node.writers {
        env.exec
            .record_write(channel.clone(), Value::Null, &spec.task_id);
    }
}

fn validate_target(graph: &Graph, from: &str, target: &str) -> Result<(), NodeError> {
    if target == END || graph.node(target).is_some() {
        Ok(())
    } else {
        Err(NodeError::Routing {
            message: format!("node '{from}' routed to unknown target '{target}'"),
        })
    }
}
