//! Per-run mutable execution state.
//!
//! One [`ExecutionContext`] exists per run. It owns the live state behind a
//! read-write lock, the lazily-created channel registry, the pending-write
//! buffer with its atomic sequence counter, the pending fan-out task queue,
//! and the versions-seen record. Locks are fine-grained: tasks touch state,
//! writes, and the queue independently without contending on one big lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;

use crate::channels::ChannelRegistry;
use crate::events::EventEmitter;
use crate::runtime::checkpoint::PendingWrite;
use crate::state::{State, StateSchema};
use crate::types::{input_channel, is_internal_key};

/// A fan-out task queued for a subsequent step.
#[derive(Clone, Debug)]
pub(crate) struct PendingTask {
    pub target: String,
    /// Branch-local state merged over the shared snapshot at task start.
    pub overlay: Option<State>,
    pub branch: String,
    pub path: Vec<String>,
}

/// Mutable state of one run, shared across its task workers.
pub struct ExecutionContext {
    state: Arc<RwLock<State>>,
    channels: ChannelRegistry,
    emitter: EventEmitter,
    pending_writes: Mutex<Vec<PendingWrite>>,
    pending_tasks: Mutex<Vec<PendingTask>>,
    versions_seen: Mutex<FxHashMap<String, FxHashMap<String, i64>>>,
    updated_keys: Mutex<FxHashSet<String>>,
    sequence: AtomicI64,
    last_checkpoint_id: Mutex<Option<String>>,
}

impl ExecutionContext {
    pub(crate) fn new(state: State, emitter: EventEmitter) -> Self {
        Self {
            state: Arc::new(RwLock::new(state)),
            channels: ChannelRegistry::new(),
            emitter,
            pending_writes: Mutex::new(Vec::new()),
            pending_tasks: Mutex::new(Vec::new()),
            versions_seen: Mutex::new(FxHashMap::default()),
            updated_keys: Mutex::new(FxHashSet::default()),
            sequence: AtomicI64::new(0),
            last_checkpoint_id: Mutex::new(None),
        }
    }

    pub(crate) fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    pub(crate) fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    /// Shared handle to the live state, handed to node contexts for the
    /// suspend protocol.
    pub(crate) fn live_state(&self) -> Arc<RwLock<State>> {
        Arc::clone(&self.state)
    }

    /// Sanitized deep copy of the live state.
    pub(crate) fn snapshot(&self) -> State {
        self.state.read().sanitized_clone()
    }

    pub(crate) fn state_len(&self) -> usize {
        self.state.read().len()
    }

    pub(crate) fn get_value(&self, key: &str) -> Option<Value> {
        self.state.read().get(key).cloned()
    }

    pub(crate) fn insert_value(&self, key: &str, value: Value) {
        self.state.write().insert(key, value);
    }

    pub(crate) fn take_value(&self, key: &str) -> Option<Value> {
        self.state.write().remove(key)
    }

    /// Merges a delta into the live state through the schema, recording the
    /// written keys for the step's state-update event.
    pub(crate) fn apply_update(&self, schema: &StateSchema, delta: State) -> Vec<String> {
        let updated = {
            let mut state = self.state.write();
            schema.apply_update(&mut state, delta)
        };
        self.updated_keys.lock().extend(updated.iter().cloned());
        updated
    }

    /// Keys written since the last call, sorted.
    pub(crate) fn take_updated_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.updated_keys.lock().drain().collect();
        keys.sort();
        keys
    }

    /// Buffers a channel write with the next sequence number.
    pub(crate) fn record_write(&self, channel: impl Into<String>, value: Value, task_id: &str) {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.pending_writes.lock().push(PendingWrite {
            channel: channel.into(),
            value,
            task_id: task_id.to_string(),
            sequence,
        });
    }

    /// Drains the pending-write buffer in sequence order.
    pub(crate) fn take_pending_writes(&self) -> Vec<PendingWrite> {
        let mut writes: Vec<PendingWrite> = self.pending_writes.lock().drain(..).collect();
        writes.sort_by_key(|w| w.sequence);
        writes
    }

    /// Copy of the pending-write buffer in sequence order, buffer intact.
    pub(crate) fn pending_writes_snapshot(&self) -> Vec<PendingWrite> {
        let mut writes = self.pending_writes.lock().clone();
        writes.sort_by_key(|w| w.sequence);
        writes
    }

    /// Applies writes to the channel registry in sequence order, returning
    /// the distinct channel names written (sorted). Used both when
    /// publishing a step's writes and when replaying persisted ones.
    pub(crate) fn publish_writes(&self, writes: &[PendingWrite], step: i64) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for write in writes {
            self.channels
                .ensure(&write.channel)
                .update(write.value.clone(), step);
            if !names.contains(&write.channel) {
                names.push(write.channel.clone());
            }
        }
        names.sort();
        names
    }

    /// Moves the sequence counter past replayed writes so new sequences
    /// stay strictly increasing.
    pub(crate) fn advance_sequence_past(&self, writes: &[PendingWrite]) {
        if let Some(max) = writes.iter().map(|w| w.sequence).max() {
            let mut current = self.sequence.load(Ordering::SeqCst);
            while current < max {
                match self.sequence.compare_exchange(
                    current,
                    max,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => break,
                    Err(observed) => current = observed,
                }
            }
        }
    }

    pub(crate) fn enqueue_task(&self, task: PendingTask) {
        self.pending_tasks.lock().push(task);
    }

    pub(crate) fn drain_pending_tasks(&self) -> Vec<PendingTask> {
        self.pending_tasks.lock().drain(..).collect()
    }

    pub(crate) fn versions_seen_snapshot(&self) -> FxHashMap<String, FxHashMap<String, i64>> {
        self.versions_seen.lock().clone()
    }

    pub(crate) fn set_versions_seen(
        &self,
        versions_seen: FxHashMap<String, FxHashMap<String, i64>>,
    ) {
        *self.versions_seen.lock() = versions_seen;
    }

    pub(crate) fn mark_seen(&self, node_id: &str, channel: &str, version: i64) {
        self.versions_seen
            .lock()
            .entry(node_id.to_string())
            .or_default()
            .insert(channel.to_string(), version);
    }

    pub(crate) fn last_seen(&self, node_id: &str, channel: &str) -> Option<i64> {
        self.versions_seen
            .lock()
            .get(node_id)
            .and_then(|seen| seen.get(channel))
            .copied()
    }

    pub(crate) fn set_last_checkpoint_id(&self, id: Option<String>) {
        *self.last_checkpoint_id.lock() = id;
    }

    pub(crate) fn last_checkpoint_id(&self) -> Option<String> {
        self.last_checkpoint_id.lock().clone()
    }

    /// Seeds `input:<key>` channels from the initial state of a fresh run.
    pub(crate) fn seed_input_channels(&self) {
        let entries: Vec<(String, Value)> = {
            let state = self.state.read();
            state
                .iter()
                .filter(|(key, _)| !is_internal_key(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        };
        for (key, value) in entries {
            self.channels.ensure(&input_channel(&key)).update(value, -1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_channel;
    use serde_json::json;

    fn context() -> ExecutionContext {
        let (emitter, _stream) = event_channel(8);
        ExecutionContext::new(State::new().with("input", json!("x")), emitter)
    }

    #[test]
    fn sequences_are_strictly_increasing_and_unique() {
        let ctx = context();
        for i in 0..10 {
            ctx.record_write(format!("ch{i}"), json!(null), "t");
        }
        let writes = ctx.take_pending_writes();
        let sequences: Vec<i64> = writes.iter().map(|w| w.sequence).collect();
        for pair in sequences.windows(2) {
            assert!(pair[1] > pair[0]);
        }
        assert_eq!(sequences.len(), 10);
    }

    #[test]
    fn advance_sequence_past_replayed_writes() {
        let ctx = context();
        let replayed = vec![PendingWrite {
            channel: "c".into(),
            value: json!(null),
            task_id: "t".into(),
            sequence: 41,
        }];
        ctx.advance_sequence_past(&replayed);
        ctx.record_write("c2", json!(null), "t");
        let writes = ctx.take_pending_writes();
        assert_eq!(writes[0].sequence, 42);
    }

    #[test]
    fn publish_writes_reproduces_versions_in_order() {
        let ctx = context();
        ctx.record_write("branch:to:a", json!(null), "t1");
        ctx.record_write("branch:to:a", json!(null), "t2");
        ctx.record_write("branch:to:b", json!(null), "t1");
        let writes = ctx.take_pending_writes();
        let updated = ctx.publish_writes(&writes, 0);
        assert_eq!(updated, vec!["branch:to:a", "branch:to:b"]);
        assert_eq!(ctx.channels().ensure("branch:to:a").version(), 2);
        assert_eq!(ctx.channels().ensure("branch:to:b").version(), 1);
    }

    #[test]
    fn seed_input_channels_skips_internal_keys() {
        let (emitter, _stream) = event_channel(8);
        let ctx = ExecutionContext::new(
            State::new()
                .with("query", json!("hello"))
                .with(crate::types::KEY_RESUME, json!(true)),
            emitter,
        );
        ctx.seed_input_channels();
        assert!(ctx.channels().get("input:query").is_some());
        assert!(ctx.channels().get("input:__resume__").is_none());
    }
}
