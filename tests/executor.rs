use std::sync::Arc;

use serde_json::json;

use graphflow::command::{Command, NodeOutput};
use graphflow::graph::{EdgePredicate, GraphBuilder, NodeOptions};
use graphflow::node::FnNode;
use graphflow::reducers::{Append, MapMerge};
use graphflow::runtime::{Executor, Invocation, RunOptions};
use graphflow::state::{FieldKind, State, StateField, StateSchema};

mod common;
use common::*;

#[tokio::test]
async fn linear_pipeline_processes_input() {
    let graph = GraphBuilder::new()
        .add_node(
            "process",
            FnNode::new(|_ctx, state: State| async move {
                let input = state.get_str("input").unwrap_or_default().to_string();
                Ok(NodeOutput::update(
                    State::new().with("processed", json!(format!("Processed: {input}"))),
                ))
            }),
        )
        .set_entry_point("process")
        .set_finish_point("process")
        .compile()
        .unwrap();

    let executor = Executor::new(graph);
    let stream = executor.execute(
        input_state("test data"),
        Invocation::new(),
        RunOptions::default(),
    );
    let events = stream.collect_until_complete().await;

    assert_eq!(started_nodes(&events), vec!["process"]);
    assert_eq!(completed_nodes(&events), vec!["process"]);

    let done = completion(&events).expect("run should complete");
    assert_eq!(
        done.state_delta.get("processed"),
        Some(&json!("Processed: test data"))
    );
    assert_eq!(done.total_steps, 1);
}

fn routing_graph() -> graphflow::graph::Graph {
    let predicate: EdgePredicate = Arc::new(|state: &State| {
        let input = state.get_str("input").unwrap_or_default();
        Ok(if input.len() > 10 { "long" } else { "short" }.to_string())
    });
    GraphBuilder::new()
        .add_node("decision", passthrough_node())
        .add_node(
            "long_process",
            set_node("result", json!("Long processing completed")),
        )
        .add_node(
            "short_process",
            set_node("result", json!("Short processing completed")),
        )
        .set_entry_point("decision")
        .add_conditional_edge(
            "decision",
            predicate,
            [("long", "long_process"), ("short", "short_process")],
        )
        .set_finish_point("long_process")
        .set_finish_point("short_process")
        .compile()
        .unwrap()
}

#[tokio::test]
async fn conditional_routing_picks_short_path() {
    let executor = Executor::new(routing_graph());
    let final_state = executor
        .invoke(input_state("short"), Invocation::new(), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(
        final_state.get("result"),
        Some(&json!("Short processing completed"))
    );
}

#[tokio::test]
async fn conditional_routing_picks_long_path() {
    let executor = Executor::new(routing_graph());
    let final_state = executor
        .invoke(
            input_state("this is a very long input string"),
            Invocation::new(),
            RunOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(
        final_state.get("result"),
        Some(&json!("Long processing completed"))
    );
}

#[tokio::test]
async fn reducers_compose_across_steps() {
    let schema = StateSchema::new()
        .field("counter", StateField::new(FieldKind::Integer))
        .field(
            "items",
            StateField::new(FieldKind::List)
                .with_reducer(Arc::new(Append))
                .with_default(json!([])),
        )
        .field(
            "metadata",
            StateField::new(FieldKind::Map)
                .with_reducer(Arc::new(MapMerge))
                .with_default(json!({})),
        );

    let step1 = FnNode::new(|_ctx, _state: State| async move {
        Ok(NodeOutput::update(
            State::new()
                .with("counter", json!(1))
                .with("items", json!(["item1"]))
                .with("metadata", json!({"step": "1"})),
        ))
    });
    let step2 = FnNode::new(|_ctx, _state: State| async move {
        Ok(NodeOutput::update(
            State::new()
                .with("counter", json!(2))
                .with("items", json!(["item2"]))
                .with("metadata", json!({"step": "2", "extra": "data"})),
        ))
    });

    let graph = GraphBuilder::new()
        .with_schema(schema)
        .add_node("step1", step1)
        .add_node("step2", step2)
        .set_entry_point("step1")
        .add_edge("step1", "step2")
        .set_finish_point("step2")
        .compile()
        .unwrap();

    let final_state = Executor::new(graph)
        .invoke(State::new(), Invocation::new(), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(final_state.get("counter"), Some(&json!(2)));
    assert_eq!(final_state.get("items"), Some(&json!(["item1", "item2"])));
    assert_eq!(
        final_state.get("metadata"),
        Some(&json!({"step": "2", "extra": "data"}))
    );
}

fn command_graph() -> graphflow::graph::Graph {
    let decision = FnNode::new(|_ctx, state: State| async move {
        let input = state.get_str("input").unwrap_or_default();
        if input.len() > 5 {
            Ok(NodeOutput::Command(
                Command::new()
                    .with_update(State::new().with("route_taken", json!("long_path")))
                    .with_goto("long_process"),
            ))
        } else {
            Ok(NodeOutput::update(
                State::new().with("route_taken", json!("short_path")),
            ))
        }
    });
    GraphBuilder::new()
        .add_node_with(
            "decision",
            decision,
            NodeOptions::new().with_destination("long_process"),
        )
        .add_node(
            "long_process",
            set_node("result", json!("Long processing via Command")),
        )
        .add_node(
            "short_process",
            set_node("result", json!("Short processing via edges")),
        )
        .set_entry_point("decision")
        .add_edge("decision", "short_process")
        .set_finish_point("long_process")
        .set_finish_point("short_process")
        .compile()
        .unwrap()
}

#[tokio::test]
async fn command_goto_overrides_static_edges() {
    let executor = Executor::new(command_graph());
    let stream = executor.execute(
        input_state("very long input string"),
        Invocation::new(),
        RunOptions::default(),
    );
    let events = stream.collect_until_complete().await;

    // The goto suppressed the static edge: short_process never ran.
    let started = started_nodes(&events);
    assert!(started.contains(&"long_process".to_string()));
    assert!(!started.contains(&"short_process".to_string()));

    let done = completion(&events).unwrap();
    assert_eq!(
        done.state_delta.get("result"),
        Some(&json!("Long processing via Command"))
    );
    assert_eq!(done.state_delta.get("route_taken"), Some(&json!("long_path")));
}

#[tokio::test]
async fn plain_update_follows_static_edges() {
    let executor = Executor::new(command_graph());
    let final_state = executor
        .invoke(input_state("short"), Invocation::new(), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(
        final_state.get("result"),
        Some(&json!("Short processing via edges"))
    );
    assert_eq!(final_state.get("route_taken"), Some(&json!("short_path")));
}

#[tokio::test]
async fn fan_out_commands_use_target_writers() {
    let schema = StateSchema::new().field(
        "results",
        StateField::new(FieldKind::List)
            .with_reducer(Arc::new(Append))
            .with_default(json!([])),
    );

    let fan = FnNode::new(|_ctx, _state: State| async move {
        Ok(NodeOutput::Commands(vec![
            Command::new()
                .with_update(State::new().with("branch_label", json!("a")))
                .with_goto("worker_a"),
            Command::new()
                .with_update(State::new().with("branch_label", json!("b")))
                .with_goto("worker_b"),
        ]))
    });
    let worker = |name: &'static str| {
        FnNode::new(move |_ctx, state: State| async move {
            let label = state.get_str("branch_label").unwrap_or_default();
            Ok(NodeOutput::update(
                State::new().with("results", json!([format!("{name}:{label}")])),
            ))
        })
    };

    let graph = GraphBuilder::new()
        .with_schema(schema)
        .add_node_with(
            "fan",
            fan,
            NodeOptions::new()
                .with_destination("worker_a")
                .with_destination("worker_b"),
        )
        .add_node("worker_a", worker("worker_a"))
        .add_node("worker_b", worker("worker_b"))
        .add_node("sink", set_node("sink_ran", json!(true)))
        .add_node("collect", set_node("collected", json!(true)))
        .set_entry_point("fan")
        // Static edge that fan-out must NOT fire.
        .add_edge("fan", "sink")
        // worker_a's own writer: fires after its branch runs.
        .add_edge("worker_a", "collect")
        .set_finish_point("worker_b")
        .set_finish_point("collect")
        .set_finish_point("sink")
        .compile()
        .unwrap();

    let stream = Executor::new(graph).execute(
        State::new(),
        Invocation::new(),
        RunOptions::default(),
    );
    let events = stream.collect_until_complete().await;
    let done = completion(&events).expect("fan-out run should complete");

    let results = done.state_delta.get("results").unwrap().as_array().unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.contains(&json!("worker_a:a")));
    assert!(results.contains(&json!("worker_b:b")));

    // Fan-out suppressed the fanning node's writers, but the target's own
    // writers still fired.
    assert!(done.state_delta.get("sink_ran").is_none());
    assert_eq!(done.state_delta.get("collected"), Some(&json!(true)));
}

#[tokio::test]
async fn nil_output_still_fires_static_writers() {
    let graph = GraphBuilder::new()
        .add_node("silent", passthrough_node())
        .add_node("downstream", set_node("downstream_ran", json!(true)))
        .set_entry_point("silent")
        .add_edge("silent", "downstream")
        .set_finish_point("downstream")
        .compile()
        .unwrap();

    let final_state = Executor::new(graph)
        .invoke(State::new(), Invocation::new(), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(final_state.get("downstream_ran"), Some(&json!(true)));
}

#[tokio::test]
async fn zero_max_steps_completes_without_running() {
    let graph = GraphBuilder::new()
        .add_node("process", set_node("ran", json!(true)))
        .set_entry_point("process")
        .set_finish_point("process")
        .compile()
        .unwrap();

    let stream = Executor::new(graph).execute(
        input_state("x"),
        Invocation::new(),
        RunOptions::default().with_max_steps(0),
    );
    let events = stream.collect_until_complete().await;

    assert!(started_nodes(&events).is_empty());
    let done = completion(&events).unwrap();
    assert_eq!(done.total_steps, 0);
    assert!(done.state_delta.get("ran").is_none());
}

#[tokio::test]
async fn node_starts_and_completes_pair_up() {
    let graph = GraphBuilder::new()
        .add_node("a", passthrough_node())
        .add_node("b", passthrough_node())
        .add_node("c", passthrough_node())
        .set_entry_point("a")
        .add_edge("a", "b")
        .add_edge("b", "c")
        .set_finish_point("c")
        .compile()
        .unwrap();

    let stream = Executor::new(graph).execute(
        State::new(),
        Invocation::new(),
        RunOptions::default(),
    );
    let events = stream.collect_until_complete().await;

    assert_eq!(started_nodes(&events), vec!["a", "b", "c"]);
    assert_eq!(completed_nodes(&events), vec!["a", "b", "c"]);
    assert_eq!(completion(&events).unwrap().total_steps, 3);
}
