//! Identifier generation for runs, tasks, checkpoints, and lineages.

use chrono::Utc;
use uuid::Uuid;

/// Generates the ids the runtime hands out.
///
/// Invocation, task, and checkpoint ids are random (UUID v4); lineage ids
/// fall back to a nanosecond timestamp so sibling lineages sort by creation
/// time in storage listings.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdGenerator;

impl IdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    #[must_use]
    pub fn generate_invocation_id(&self) -> String {
        format!("invoke-{}", Uuid::new_v4().simple())
    }

    #[must_use]
    pub fn generate_task_id(&self) -> String {
        format!("task-{}", Uuid::new_v4().simple())
    }

    #[must_use]
    pub fn generate_checkpoint_id(&self) -> String {
        format!("ckpt-{}", Uuid::new_v4().simple())
    }

    /// Lineage id used when neither configuration nor the invocation
    /// provides one.
    #[must_use]
    pub fn generate_lineage_id(&self) -> String {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        format!("lineage_{nanos}")
    }
}
