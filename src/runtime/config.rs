//! Run configuration: invocation identity and per-run limits.

use std::time::Duration;

use crate::runtime::checkpoint::CheckpointConfig;
use crate::utils::id_generator::IdGenerator;

/// Default superstep budget for a run.
pub const DEFAULT_MAX_STEPS: i64 = 100;
/// Default budget for a single checkpoint save.
pub const DEFAULT_CHECKPOINT_SAVE_TIMEOUT: Duration = Duration::from_secs(10);
/// Floor applied to node timeouts derived from the step timeout.
pub const MIN_DERIVED_NODE_TIMEOUT: Duration = Duration::from_secs(1);

/// Identity of one run: its id, optional parent, and branch label.
///
/// Fan-out branches derive child branch labels from the parent branch and
/// the fanning node's id, which keeps concurrent branches distinguishable
/// in events and logs.
#[derive(Clone, Debug)]
pub struct Invocation {
    pub invocation_id: String,
    pub parent_invocation_id: Option<String>,
    pub branch: String,
}

impl Default for Invocation {
    fn default() -> Self {
        Self::new()
    }
}

impl Invocation {
    /// Fresh invocation with a generated id and the root branch.
    #[must_use]
    pub fn new() -> Self {
        Self {
            invocation_id: IdGenerator::new().generate_invocation_id(),
            parent_invocation_id: None,
            branch: String::new(),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.invocation_id = id.into();
        self
    }

    #[must_use]
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent_invocation_id = Some(parent.into());
        self
    }

    #[must_use]
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = branch.into();
        self
    }

    /// Branch label for the `index`-th fan-out command of `node_id`.
    #[must_use]
    pub fn child_branch(&self, node_id: &str, index: usize) -> String {
        if self.branch.is_empty() {
            format!("{node_id}:{index}")
        } else {
            format!("{}/{node_id}:{index}", self.branch)
        }
    }
}

/// Per-run execution limits and checkpoint addressing.
#[derive(Clone, Debug)]
pub struct RunOptions {
    /// Superstep budget; `0` completes immediately with zero steps.
    pub max_steps: i64,
    /// Optional wall-clock budget per superstep.
    pub step_timeout: Option<Duration>,
    /// Optional budget per node invocation. When unset and a step timeout
    /// exists, half the step timeout (at least one second) is used.
    pub node_timeout: Option<Duration>,
    /// Budget for each checkpoint save.
    pub checkpoint_save_timeout: Duration,
    /// Capacity of the event channel.
    pub event_buffer: usize,
    /// Checkpoint addressing: lineage, namespace, optional checkpoint id,
    /// optional resume map.
    pub config: CheckpointConfig,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            step_timeout: None,
            node_timeout: None,
            checkpoint_save_timeout: DEFAULT_CHECKPOINT_SAVE_TIMEOUT,
            event_buffer: crate::events::DEFAULT_EVENT_BUFFER,
            config: CheckpointConfig::default(),
        }
    }
}

impl RunOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_steps(mut self, max_steps: i64) -> Self {
        self.max_steps = max_steps;
        self
    }

    #[must_use]
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: CheckpointConfig) -> Self {
        self.config = config;
        self
    }

    /// The node timeout in effect: explicit, derived from the step timeout
    /// (half of it, at least one second), or none.
    #[must_use]
    pub fn effective_node_timeout(&self) -> Option<Duration> {
        self.node_timeout.or_else(|| {
            self.step_timeout
                .map(|step| (step / 2).max(MIN_DERIVED_NODE_TIMEOUT))
        })
    }
}
