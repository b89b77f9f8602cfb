//! Execution runtime: the BSP executor and its supporting protocols.
//!
//! - [`Executor`] — the step loop (plan, execute, update) and event
//!   emission
//! - [`checkpoint`] — durable snapshots, pending writes, the saver trait,
//!   forking
//! - [`interrupt`] — the suspend/resume protocol
//! - [`config`] — invocation identity and per-run limits

pub mod checkpoint;
pub mod config;
pub(crate) mod context;
pub mod executor;
pub mod interrupt;
pub(crate) mod planner;
pub(crate) mod task;

pub use checkpoint::{
    Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSaver, CheckpointSource,
    CheckpointTuple, InMemorySaver, PendingWrite, PutFullRequest, PutRequest, SaverError, fork,
};
pub use config::{
    DEFAULT_CHECKPOINT_SAVE_TIMEOUT, DEFAULT_MAX_STEPS, Invocation, MIN_DERIVED_NODE_TIMEOUT,
    RunOptions,
};
pub use executor::{Executor, ExecutorError};
pub use interrupt::{InterruptError, InterruptState};
