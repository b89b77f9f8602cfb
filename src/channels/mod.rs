//! Versioned signal channels.
//!
//! A [`Channel`] is a named single-slot store used to signal node execution
//! between supersteps. Writing bumps a monotonically increasing version,
//! marks the step the write happened in, and raises the `available` flag;
//! acknowledging clears the flag without touching the version. The planner
//! compares channel versions against each node's versions-seen record to
//! decide what runs next.
//!
//! Channels are created lazily through the [`ChannelRegistry`] as routing
//! requires them (`branch:to:<node>` and `trigger:<node>` channels do not
//! exist until something writes to them).

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Merge behavior of a channel slot.
///
/// Only last-value-wins exists today; the enum leaves room for accumulating
/// behaviors without changing the wire format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelBehavior {
    /// The most recent write replaces the slot contents.
    #[default]
    LastValue,
}

impl fmt::Display for ChannelBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LastValue => write!(f, "last_value"),
        }
    }
}

#[derive(Debug, Default)]
struct ChannelCell {
    version: i64,
    available: bool,
    step_mark: i64,
    last_value: Option<Value>,
}

/// A named, versioned single-slot store.
///
/// All mutation goes through the per-channel lock; versions never decrease
/// for the lifetime of a run.
#[derive(Debug)]
pub struct Channel {
    name: String,
    behavior: ChannelBehavior,
    cell: RwLock<ChannelCell>,
}

impl Channel {
    /// Creates an empty channel at version 0.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            behavior: ChannelBehavior::LastValue,
            cell: RwLock::new(ChannelCell {
                version: 0,
                available: false,
                step_mark: -1,
                last_value: None,
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn behavior(&self) -> ChannelBehavior {
        self.behavior
    }

    /// Writes a value: stores it (last-value-wins), bumps the version, marks
    /// the step, and raises availability. Returns the new version.
    pub fn update(&self, value: Value, step: i64) -> i64 {
        let mut cell = self.cell.write();
        cell.version += 1;
        cell.available = true;
        cell.step_mark = step;
        cell.last_value = Some(value);
        cell.version
    }

    /// Lowers the availability flag without altering the version.
    pub fn acknowledge(&self) {
        self.cell.write().available = false;
    }

    #[must_use]
    pub fn is_available(&self) -> bool {
        self.cell.read().available
    }

    #[must_use]
    pub fn is_updated_in_step(&self, step: i64) -> bool {
        self.cell.read().step_mark == step
    }

    /// Resets the step mark after a checkpoint boundary.
    pub fn clear_step_mark(&self) {
        self.cell.write().step_mark = -1;
    }

    #[must_use]
    pub fn version(&self) -> i64 {
        self.cell.read().version
    }

    #[must_use]
    pub fn last_value(&self) -> Option<Value> {
        self.cell.read().last_value.clone()
    }

    /// Restores the version counter from a checkpoint. Availability and the
    /// step mark stay cleared; pending-write replay re-raises them.
    pub fn restore_version(&self, version: i64) {
        let mut cell = self.cell.write();
        if version > cell.version {
            cell.version = version;
        }
    }
}

/// Lazily creates and indexes the channels of one run.
#[derive(Default)]
pub struct ChannelRegistry {
    inner: RwLock<FxHashMap<String, Arc<Channel>>>,
}

impl ChannelRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the channel with the given name, creating it if needed.
    pub fn ensure(&self, name: &str) -> Arc<Channel> {
        if let Some(channel) = self.inner.read().get(name) {
            return Arc::clone(channel);
        }
        let mut map = self.inner.write();
        Arc::clone(
            map.entry(name.to_string())
                .or_insert_with(|| Arc::new(Channel::new(name))),
        )
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Channel>> {
        self.inner.read().get(name).cloned()
    }

    /// Names of every channel created so far, sorted for determinism.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Current version of every channel, keyed by name.
    #[must_use]
    pub fn version_snapshot(&self) -> FxHashMap<String, i64> {
        self.inner
            .read()
            .iter()
            .map(|(name, channel)| (name.clone(), channel.version()))
            .collect()
    }

    /// Channels whose availability flag is raised, sorted by name so
    /// planning order is deterministic.
    #[must_use]
    pub fn available(&self) -> Vec<Arc<Channel>> {
        let mut channels: Vec<Arc<Channel>> = self
            .inner
            .read()
            .values()
            .filter(|channel| channel.is_available())
            .cloned()
            .collect();
        channels.sort_by(|a, b| a.name().cmp(b.name()));
        channels
    }

    /// Clears every channel's step mark after a checkpoint.
    pub fn clear_step_marks(&self) {
        for channel in self.inner.read().values() {
            channel.clear_step_mark();
        }
    }

    /// Names of channels written during the given step.
    #[must_use]
    pub fn updated_in_step(&self, step: i64) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .read()
            .values()
            .filter(|channel| channel.is_updated_in_step(step))
            .map(|channel| channel.name().to_string())
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn update_bumps_version_and_marks_step() {
        let channel = Channel::new("branch:to:worker");
        assert_eq!(channel.version(), 0);
        assert!(!channel.is_available());

        let v = channel.update(json!("payload"), 3);
        assert_eq!(v, 1);
        assert!(channel.is_available());
        assert!(channel.is_updated_in_step(3));
        assert_eq!(channel.last_value(), Some(json!("payload")));
    }

    #[test]
    fn acknowledge_preserves_version() {
        let channel = Channel::new("trigger:worker");
        channel.update(json!(null), 0);
        channel.acknowledge();
        assert!(!channel.is_available());
        assert_eq!(channel.version(), 1);
    }

    #[test]
    fn clear_step_mark_resets_step_tracking() {
        let channel = Channel::new("input:query");
        channel.update(json!("q"), 5);
        channel.clear_step_mark();
        assert!(!channel.is_updated_in_step(5));
        assert!(channel.is_available());
    }

    #[test]
    fn restore_version_never_decreases() {
        let channel = Channel::new("branch:to:b");
        channel.restore_version(7);
        assert_eq!(channel.version(), 7);
        channel.restore_version(3);
        assert_eq!(channel.version(), 7);
    }

    #[test]
    fn registry_creates_lazily_and_snapshots() {
        let registry = ChannelRegistry::new();
        registry.ensure("branch:to:a").update(json!(null), 0);
        registry.ensure("branch:to:b");

        let versions = registry.version_snapshot();
        assert_eq!(versions.get("branch:to:a"), Some(&1));
        assert_eq!(versions.get("branch:to:b"), Some(&0));

        let available = registry.available();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].name(), "branch:to:a");
    }
}
