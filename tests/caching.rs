use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;

use graphflow::cache::{CachePolicy, InMemoryCache};
use graphflow::events::ExecutionEvent;
use graphflow::graph::{GraphBuilder, NodeOptions};
use graphflow::runtime::{Executor, Invocation, RunOptions};
use graphflow::state::State;

mod common;
use common::*;

fn cached_graph(
    runs: Arc<AtomicUsize>,
    cache: Arc<InMemoryCache>,
    policy: CachePolicy,
) -> graphflow::graph::Graph {
    GraphBuilder::new()
        .with_cache(cache)
        .add_node_with(
            "expensive",
            counting_node(runs, "result", json!("computed")),
            NodeOptions::new().with_cache_policy(policy),
        )
        .set_entry_point("expensive")
        .set_finish_point("expensive")
        .compile()
        .unwrap()
}

#[tokio::test]
async fn cache_hit_skips_node_function() {
    let runs = Arc::new(AtomicUsize::new(0));
    let cache = Arc::new(InMemoryCache::new());
    let graph = cached_graph(runs.clone(), cache, CachePolicy::new());
    let executor = Executor::new(graph);

    let first = executor
        .invoke(input_state("same"), Invocation::new(), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let stream = executor.execute(input_state("same"), Invocation::new(), RunOptions::default());
    let events = stream.collect_until_complete().await;

    // Same sanitized input, same namespace: served from cache.
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    let done = completion(&events).unwrap();
    assert_eq!(done.state_delta.get("result"), first.get("result"));

    let cache_hit = events.iter().any(|event| {
        matches!(event, ExecutionEvent::NodeComplete(body) if body.cache_hit)
    });
    assert!(cache_hit, "NodeComplete should carry the cache-hit marker");
}

#[tokio::test]
async fn different_inputs_miss_the_cache() {
    let runs = Arc::new(AtomicUsize::new(0));
    let cache = Arc::new(InMemoryCache::new());
    let graph = cached_graph(runs.clone(), cache, CachePolicy::new());
    let executor = Executor::new(graph);

    executor
        .invoke(input_state("one"), Invocation::new(), RunOptions::default())
        .await
        .unwrap();
    executor
        .invoke(input_state("two"), Invocation::new(), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn expired_entries_recompute() {
    let runs = Arc::new(AtomicUsize::new(0));
    let cache = Arc::new(InMemoryCache::new());
    let graph = cached_graph(
        runs.clone(),
        cache,
        CachePolicy::new().with_ttl(Duration::from_millis(20)),
    );
    let executor = Executor::new(graph);

    executor
        .invoke(input_state("same"), Invocation::new(), RunOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    executor
        .invoke(input_state("same"), Invocation::new(), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn key_selector_narrows_the_cache_key() {
    let runs = Arc::new(AtomicUsize::new(0));
    let cache = Arc::new(InMemoryCache::new());
    let graph = GraphBuilder::new()
        .with_cache(cache)
        .add_node_with(
            "expensive",
            counting_node(runs.clone(), "result", json!("computed")),
            NodeOptions::new()
                .with_cache_policy(CachePolicy::new())
                .with_cache_key_selector(Arc::new(|state: &State| {
                    json!(state.get_str("input").unwrap_or_default())
                })),
        )
        .set_entry_point("expensive")
        .set_finish_point("expensive")
        .compile()
        .unwrap();
    let executor = Executor::new(graph);

    // Same selected key despite different surrounding state: one compute.
    executor
        .invoke(
            input_state("same").with("noise", json!(1)),
            Invocation::new(),
            RunOptions::default(),
        )
        .await
        .unwrap();
    executor
        .invoke(
            input_state("same").with("noise", json!(2)),
            Invocation::new(),
            RunOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}
