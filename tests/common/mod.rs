//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::{Value, json};

use graphflow::command::NodeOutput;
use graphflow::events::ExecutionEvent;
use graphflow::node::FnNode;
use graphflow::state::State;

/// Node that merges a fixed delta into state.
pub fn set_node(key: &str, value: Value) -> FnNode {
    let key = key.to_string();
    FnNode::new(move |_ctx, _state: State| {
        let key = key.clone();
        let value = value.clone();
        async move { Ok(NodeOutput::update(State::new().with(key, value))) }
    })
}

/// Node that does nothing, still firing its static writers.
pub fn passthrough_node() -> FnNode {
    FnNode::new(|_ctx, _state: State| async move { Ok(NodeOutput::None) })
}

/// Node that bumps a counter and merges a fixed delta.
pub fn counting_node(counter: Arc<AtomicUsize>, key: &str, value: Value) -> FnNode {
    let key = key.to_string();
    FnNode::new(move |_ctx, _state: State| {
        let counter = counter.clone();
        let key = key.clone();
        let value = value.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(NodeOutput::update(State::new().with(key, value)))
        }
    })
}

/// Initial state with a single `input` key.
pub fn input_state(input: &str) -> State {
    State::new().with("input", json!(input))
}

/// Node ids of all NodeStart events, in emission order.
pub fn started_nodes(events: &[ExecutionEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            ExecutionEvent::NodeStart(body) => Some(body.node_id.clone()),
            _ => None,
        })
        .collect()
}

/// Node ids of all NodeComplete events, in emission order.
pub fn completed_nodes(events: &[ExecutionEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            ExecutionEvent::NodeComplete(body) => Some(body.node_id.clone()),
            _ => None,
        })
        .collect()
}

/// The terminal completion event, if the run finished successfully.
pub fn completion(events: &[ExecutionEvent]) -> Option<&graphflow::events::GraphCompletion> {
    events.iter().find_map(|event| match event {
        ExecutionEvent::Completion(done) => Some(done),
        _ => None,
    })
}
