//! # graphflow: a Pregel-style agent graph runtime
//!
//! graphflow executes a user-defined directed graph of computation nodes
//! over a shared, typed state object using a Bulk Synchronous Parallel
//! step loop: plan the tasks a step should run, execute them concurrently
//! behind a join barrier, then publish channel updates and state merges
//! for the next step to observe. Around that core it coordinates
//! conditional routing, fan-out commands, retries, result caching,
//! checkpoint/resume, human-in-the-loop interrupts, and typed event
//! streaming.
//!
//! ## Quick start
//!
//! ```
//! use graphflow::command::NodeOutput;
//! use graphflow::graph::GraphBuilder;
//! use graphflow::node::FnNode;
//! use graphflow::runtime::{Executor, Invocation, RunOptions};
//! use graphflow::state::State;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let graph = GraphBuilder::new()
//!     .add_node(
//!         "process",
//!         FnNode::new(|_ctx, state: State| async move {
//!             let input = state.get_str("input").unwrap_or_default().to_string();
//!             Ok(NodeOutput::update(
//!                 State::new().with("processed", json!(format!("Processed: {input}"))),
//!             ))
//!         }),
//!     )
//!     .set_entry_point("process")
//!     .set_finish_point("process")
//!     .compile()
//!     .unwrap();
//!
//! let executor = Executor::new(graph);
//! let final_state = executor
//!     .invoke(
//!         State::new().with("input", json!("test data")),
//!         Invocation::new(),
//!         RunOptions::default(),
//!     )
//!     .await
//!     .unwrap();
//! assert_eq!(final_state.get_str("processed"), Some("Processed: test data"));
//! # }
//! ```
//!
//! ## Module guide
//!
//! - [`state`] - State map, schema, field kinds, restoration
//! - [`reducers`] - Merge strategies for state fields
//! - [`channels`] - Versioned signal channels and their registry
//! - [`graph`] - Graph builder, compilation, validation
//! - [`node`] - Node trait, task context, suspension
//! - [`command`] - Node outputs and routing commands
//! - [`callbacks`] - Node lifecycle hooks
//! - [`retry`] - Retry policies with backoff
//! - [`cache`] - Node result caching
//! - [`events`] - Typed event records and the event channel
//! - [`runtime`] - The BSP executor, checkpoints, interrupts
//! - [`telemetry`] - Tracing subscriber setup

pub mod cache;
pub mod callbacks;
pub mod channels;
pub mod command;
pub mod events;
pub mod graph;
pub mod message;
pub mod node;
pub mod reducers;
pub mod retry;
pub mod runtime;
pub mod state;
pub mod telemetry;
pub mod types;
pub mod utils;
