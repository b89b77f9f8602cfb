use std::sync::Arc;

use serde_json::json;

use super::*;
use crate::command::NodeOutput;
use crate::node::FnNode;
use crate::state::State;
use crate::types::{END, START, branch_channel, trigger_channel};

fn passthrough() -> FnNode {
    FnNode::new(|_ctx, _state: State| async move { Ok(NodeOutput::None) })
}

#[test]
fn compile_validates_entry_point() {
    let err = GraphBuilder::new()
        .add_node("a", passthrough())
        .compile()
        .unwrap_err();
    assert!(matches!(err, GraphError::MissingEntryPoint));

    let err = GraphBuilder::new()
        .add_node("a", passthrough())
        .set_entry_point("missing")
        .compile()
        .unwrap_err();
    assert!(matches!(err, GraphError::UnknownEntryPoint { .. }));
}

#[test]
fn compile_rejects_duplicate_nodes() {
    let err = GraphBuilder::new()
        .add_node("a", passthrough())
        .add_node("a", passthrough())
        .set_entry_point("a")
        .compile()
        .unwrap_err();
    assert!(matches!(err, GraphError::DuplicateNode { .. }));
}

#[test]
fn compile_rejects_virtual_node_registration() {
    let err = GraphBuilder::new()
        .add_node(START, passthrough())
        .compile()
        .unwrap_err();
    assert!(matches!(err, GraphError::VirtualNode { .. }));
}

#[test]
fn compile_rejects_dangling_edges() {
    let err = GraphBuilder::new()
        .add_node("a", passthrough())
        .set_entry_point("a")
        .add_edge("a", "ghost")
        .compile()
        .unwrap_err();
    assert!(matches!(err, GraphError::DanglingEdge { .. }));
}

#[test]
fn compile_rejects_unreachable_nodes() {
    let err = GraphBuilder::new()
        .add_node("a", passthrough())
        .add_node("island", passthrough())
        .set_entry_point("a")
        .set_finish_point("a")
        .compile()
        .unwrap_err();
    assert!(matches!(err, GraphError::Unreachable { id } if id == "island"));
}

#[test]
fn destinations_satisfy_reachability() {
    let graph = GraphBuilder::new()
        .add_node_with(
            "router",
            passthrough(),
            NodeOptions::new().with_destination("dynamic"),
        )
        .add_node("dynamic", passthrough())
        .set_entry_point("router")
        .set_finish_point("dynamic")
        .compile()
        .unwrap();
    assert!(graph.node("dynamic").is_some());
}

#[test]
fn writers_and_triggers_follow_edges() {
    let graph = GraphBuilder::new()
        .add_node("a", passthrough())
        .add_node("b", passthrough())
        .set_entry_point("a")
        .add_edge("a", "b")
        .set_finish_point("b")
        .compile()
        .unwrap();

    let a = graph.node("a").unwrap();
    assert_eq!(a.writers, vec![branch_channel("b")]);
    // Edges into __end__ produce no writer channel.
    let b = graph.node("b").unwrap();
    assert!(b.writers.is_empty());

    assert_eq!(graph.triggered_nodes(&branch_channel("b")), ["b"]);
    assert_eq!(graph.triggered_nodes(&trigger_channel("a")), ["a"]);

    let channels = graph.all_channels();
    assert!(channels.contains(&branch_channel("a")));
    assert!(channels.contains(&trigger_channel("b")));
}

#[test]
fn conditional_path_maps_are_validated() {
    let predicate: EdgePredicate = Arc::new(|state: &State| {
        Ok(if state.get("long").is_some() {
            "long".to_string()
        } else {
            "short".to_string()
        })
    });
    let err = GraphBuilder::new()
        .add_node("decision", passthrough())
        .set_entry_point("decision")
        .add_conditional_edge(
            "decision",
            predicate,
            [("long", "ghost"), ("short", END)],
        )
        .compile()
        .unwrap_err();
    assert!(matches!(err, GraphError::DanglingConditionalTarget { .. }));
}

#[test]
fn conditional_resolution_uses_path_map() {
    let predicate: EdgePredicate = Arc::new(|state: &State| {
        let input = state.get_str("input").unwrap_or_default();
        Ok(if input.len() > 10 { "long" } else { "short" }.to_string())
    });
    let edge = ConditionalEdge::new(
        "decision",
        predicate,
        [
            ("long".to_string(), "long_process".to_string()),
            ("short".to_string(), "short_process".to_string()),
        ]
        .into_iter()
        .collect(),
    );

    let target = edge
        .resolve(&State::new().with("input", json!("short")))
        .unwrap();
    assert_eq!(target, "short_process");

    let target = edge
        .resolve(&State::new().with("input", json!("this is a very long input string")))
        .unwrap();
    assert_eq!(target, "long_process");
}

#[test]
fn graph_level_interrupt_sets_apply() {
    let graph = GraphBuilder::new()
        .add_node("gate", passthrough())
        .add_node_with("review", passthrough(), NodeOptions::new().interrupt_after())
        .set_entry_point("gate")
        .add_edge("gate", "review")
        .set_finish_point("review")
        .interrupt_before(["gate"])
        .compile()
        .unwrap();

    assert!(graph.interrupts_before("gate"));
    assert!(!graph.interrupts_before("review"));
    assert!(graph.interrupts_after("review"));
}
