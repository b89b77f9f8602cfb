//! Checkpoint protocol: durable snapshots behind a pluggable saver.
//!
//! A [`Checkpoint`] captures everything resume needs: sanitized state
//! values, channel versions, each node's versions-seen record, the
//! executable frontier, and any interrupt state. [`PendingWrite`]s are
//! buffered channel writes persisted alongside the checkpoint and replayed
//! in sequence order on resume.
//!
//! The engine only depends on the [`CheckpointSaver`] trait; storage
//! specifics stay behind it. The config keys recognised at the boundary
//! are `lineage_id`, `checkpoint_id`, `checkpoint_ns`, and `resume_map`,
//! read flat or nested under `configurable`.
//!
//! [`InMemorySaver`] is the in-crate reference implementation: full lineage
//! history, process-local, suitable for tests and ephemeral runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::runtime::interrupt::InterruptState;
use crate::utils::id_generator::IdGenerator;

/// What produced a checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointSource {
    /// The initial checkpoint written before step 0.
    Input,
    /// A regular per-step checkpoint.
    Loop,
    /// A copy created by [`fork`].
    Fork,
    /// A checkpoint persisted when a run interrupted.
    Interrupt,
}

impl std::fmt::Display for CheckpointSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Loop => write!(f, "loop"),
            Self::Fork => write!(f, "fork"),
            Self::Interrupt => write!(f, "interrupt"),
        }
    }
}

/// Addressing information handed to the saver.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Logical identifier grouping a family of checkpoints.
    pub lineage_id: Option<String>,
    /// Specific checkpoint to load; `None` selects the latest.
    pub checkpoint_id: Option<String>,
    /// Namespace isolating checkpoint families within a lineage.
    #[serde(default)]
    pub checkpoint_ns: String,
    /// Resume values supplied through configuration.
    pub resume_map: Option<FxHashMap<String, Value>>,
}

impl CheckpointConfig {
    /// Config addressing the latest checkpoint of a lineage.
    #[must_use]
    pub fn for_lineage(lineage_id: impl Into<String>) -> Self {
        Self {
            lineage_id: Some(lineage_id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    #[must_use]
    pub fn with_namespace(mut self, ns: impl Into<String>) -> Self {
        self.checkpoint_ns = ns.into();
        self
    }

    /// Reads the recognised keys from a JSON configuration map, flat or
    /// nested under `configurable`.
    ///
    /// ```
    /// use graphflow::runtime::CheckpointConfig;
    /// use serde_json::json;
    ///
    /// let flat = CheckpointConfig::from_value(&json!({"lineage_id": "lin-1"}));
    /// let nested = CheckpointConfig::from_value(&json!({
    ///     "configurable": {"lineage_id": "lin-1"}
    /// }));
    /// assert_eq!(flat, nested);
    /// ```
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        let map = match value.get("configurable") {
            Some(Value::Object(configurable)) => Some(configurable),
            _ => value.as_object(),
        };
        let Some(map) = map else {
            return Self::default();
        };
        Self {
            lineage_id: map
                .get("lineage_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            checkpoint_id: map
                .get("checkpoint_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            checkpoint_ns: map
                .get("checkpoint_ns")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            resume_map: map.get("resume_map").and_then(|v| {
                v.as_object().map(|entries| {
                    entries
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect()
                })
            }),
        }
    }
}

/// A durable snapshot of run state at a step boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    /// Parent checkpoint in the lineage, `None` for the initial one.
    pub parent_id: Option<String>,
    /// Sanitized state values keyed by state key.
    pub channel_values: FxHashMap<String, Value>,
    /// Version of every signal channel at save time.
    pub channel_versions: FxHashMap<String, i64>,
    /// Last channel version each node has consumed.
    pub versions_seen: FxHashMap<String, FxHashMap<String, i64>>,
    /// Channels published in the step that produced this checkpoint.
    #[serde(default)]
    pub updated_channels: Vec<String>,
    /// Executable frontier for resume.
    #[serde(default)]
    pub next_nodes: Vec<String>,
    /// Channels feeding the frontier.
    #[serde(default)]
    pub next_channels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt_state: Option<InterruptState>,
    pub timestamp: DateTime<Utc>,
}

/// Metadata stored next to a checkpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub source: CheckpointSource,
    /// Step the checkpoint was taken after; `-1` for the initial one.
    pub step: i64,
}

/// A buffered channel write, replayed in sequence order on resume.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub channel: String,
    pub value: Value,
    pub task_id: String,
    pub sequence: i64,
}

/// Everything a saver returns for one checkpoint.
#[derive(Clone, Debug)]
pub struct CheckpointTuple {
    pub config: CheckpointConfig,
    pub checkpoint: Checkpoint,
    pub metadata: CheckpointMetadata,
    pub pending_writes: Vec<PendingWrite>,
}

/// Store a checkpoint only.
#[derive(Clone, Debug)]
pub struct PutRequest {
    pub config: CheckpointConfig,
    pub checkpoint: Checkpoint,
    pub metadata: CheckpointMetadata,
}

/// Atomically store a checkpoint and its pending writes.
#[derive(Clone, Debug)]
pub struct PutFullRequest {
    pub config: CheckpointConfig,
    pub checkpoint: Checkpoint,
    pub metadata: CheckpointMetadata,
    pub pending_writes: Vec<PendingWrite>,
}

/// Errors from saver operations.
#[derive(Debug, Error, Diagnostic)]
pub enum SaverError {
    #[error("no checkpoint found for lineage '{lineage_id}'")]
    #[diagnostic(code(graphflow::checkpoint::not_found))]
    NotFound { lineage_id: String },

    #[error("missing lineage id in checkpoint config")]
    #[diagnostic(
        code(graphflow::checkpoint::missing_lineage),
        help("Set `lineage_id` (or rely on the invocation id fallback) before using a saver.")
    )]
    MissingLineage,

    #[error("checkpoint backend error: {message}")]
    #[diagnostic(code(graphflow::checkpoint::backend))]
    Backend { message: String },

    #[error(transparent)]
    #[diagnostic(code(graphflow::checkpoint::serde))]
    Serde(#[from] serde_json::Error),
}

/// Pluggable persistence for checkpoints and pending writes.
///
/// Implementations must make `get_tuple` idempotent and `put_full` atomic:
/// a checkpoint is never visible without its pending writes.
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Loads the checkpoint addressed by `config` (specific id, or latest
    /// for the lineage and namespace). `Ok(None)` when nothing is stored.
    async fn get_tuple(&self, config: &CheckpointConfig)
        -> Result<Option<CheckpointTuple>, SaverError>;

    /// Stores a checkpoint only. Returns the config updated with the stored
    /// checkpoint's id.
    async fn put(&self, req: PutRequest) -> Result<CheckpointConfig, SaverError>;

    /// Atomically stores a checkpoint and its pending writes. Returns the
    /// config updated with the stored checkpoint's id.
    async fn put_full(&self, req: PutFullRequest) -> Result<CheckpointConfig, SaverError>;
}

/// Copies the checkpoint addressed by `config` under a fresh id with
/// `parent_id` pointing at the source, carrying its pending writes, and
/// persists it in the same lineage and namespace with source `fork`.
///
/// The fork preserves `next_nodes` and the version maps, so resuming it
/// continues from the same frontier as the source.
pub async fn fork(
    saver: &dyn CheckpointSaver,
    config: &CheckpointConfig,
) -> Result<CheckpointConfig, SaverError> {
    let tuple = saver
        .get_tuple(config)
        .await?
        .ok_or_else(|| SaverError::NotFound {
            lineage_id: config.lineage_id.clone().unwrap_or_default(),
        })?;

    let mut checkpoint = tuple.checkpoint;
    checkpoint.parent_id = Some(checkpoint.id.clone());
    checkpoint.id = IdGenerator::new().generate_checkpoint_id();
    checkpoint.timestamp = Utc::now();

    let fork_config = CheckpointConfig {
        lineage_id: tuple.config.lineage_id.clone(),
        checkpoint_id: Some(checkpoint.id.clone()),
        checkpoint_ns: tuple.config.checkpoint_ns.clone(),
        resume_map: None,
    };
    saver
        .put_full(PutFullRequest {
            config: fork_config,
            metadata: CheckpointMetadata {
                source: CheckpointSource::Fork,
                step: tuple.metadata.step,
            },
            checkpoint,
            pending_writes: tuple.pending_writes,
        })
        .await
}

#[derive(Clone)]
struct StoredCheckpoint {
    checkpoint: Checkpoint,
    metadata: CheckpointMetadata,
    pending_writes: Vec<PendingWrite>,
}

#[derive(Default)]
struct LineageStore {
    order: Vec<String>,
    items: FxHashMap<String, StoredCheckpoint>,
}

/// Process-local saver keeping the full checkpoint history per lineage and
/// namespace.
#[derive(Default)]
pub struct InMemorySaver {
    inner: RwLock<FxHashMap<(String, String), LineageStore>>,
}

impl InMemorySaver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of checkpoints stored for a lineage (default namespace).
    #[must_use]
    pub fn history_len(&self, lineage_id: &str) -> usize {
        self.inner
            .read()
            .get(&(lineage_id.to_string(), String::new()))
            .map_or(0, |store| store.order.len())
    }

    fn store(
        &self,
        config: CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        pending_writes: Vec<PendingWrite>,
    ) -> Result<CheckpointConfig, SaverError> {
        let lineage_id = config.lineage_id.clone().ok_or(SaverError::MissingLineage)?;
        let checkpoint_id = checkpoint.id.clone();

        let mut inner = self.inner.write();
        let store = inner
            .entry((lineage_id, config.checkpoint_ns.clone()))
            .or_default();
        if !store.items.contains_key(&checkpoint_id) {
            store.order.push(checkpoint_id.clone());
        }
        store.items.insert(
            checkpoint_id.clone(),
            StoredCheckpoint {
                checkpoint,
                metadata,
                pending_writes,
            },
        );

        Ok(CheckpointConfig {
            checkpoint_id: Some(checkpoint_id),
            ..config
        })
    }
}

#[async_trait]
impl CheckpointSaver for InMemorySaver {
    async fn get_tuple(
        &self,
        config: &CheckpointConfig,
    ) -> Result<Option<CheckpointTuple>, SaverError> {
        let Some(lineage_id) = config.lineage_id.clone() else {
            return Ok(None);
        };
        let inner = self.inner.read();
        let Some(store) = inner.get(&(lineage_id.clone(), config.checkpoint_ns.clone())) else {
            return Ok(None);
        };
        let id = match &config.checkpoint_id {
            Some(id) => Some(id.clone()),
            None => store.order.last().cloned(),
        };
        let Some(id) = id else { return Ok(None) };
        Ok(store.items.get(&id).map(|stored| CheckpointTuple {
            config: CheckpointConfig {
                lineage_id: Some(lineage_id),
                checkpoint_id: Some(id),
                checkpoint_ns: config.checkpoint_ns.clone(),
                resume_map: None,
            },
            checkpoint: stored.checkpoint.clone(),
            metadata: stored.metadata.clone(),
            pending_writes: stored.pending_writes.clone(),
        }))
    }

    async fn put(&self, req: PutRequest) -> Result<CheckpointConfig, SaverError> {
        self.store(req.config, req.checkpoint, req.metadata, Vec::new())
    }

    async fn put_full(&self, req: PutFullRequest) -> Result<CheckpointConfig, SaverError> {
        self.store(req.config, req.checkpoint, req.metadata, req.pending_writes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn checkpoint(id: &str, parent: Option<&str>) -> Checkpoint {
        Checkpoint {
            id: id.to_string(),
            parent_id: parent.map(str::to_string),
            channel_values: FxHashMap::default(),
            channel_versions: FxHashMap::default(),
            versions_seen: FxHashMap::default(),
            updated_channels: vec![],
            next_nodes: vec!["worker".to_string()],
            next_channels: vec![],
            interrupt_state: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn latest_wins_without_checkpoint_id() {
        let saver = InMemorySaver::new();
        let config = CheckpointConfig::for_lineage("lin");
        for id in ["cp1", "cp2"] {
            saver
                .put_full(PutFullRequest {
                    config: config.clone(),
                    checkpoint: checkpoint(id, None),
                    metadata: CheckpointMetadata {
                        source: CheckpointSource::Loop,
                        step: 0,
                    },
                    pending_writes: vec![],
                })
                .await
                .unwrap();
        }
        let tuple = saver.get_tuple(&config).await.unwrap().unwrap();
        assert_eq!(tuple.checkpoint.id, "cp2");

        let pinned = config.with_checkpoint_id("cp1");
        let tuple = saver.get_tuple(&pinned).await.unwrap().unwrap();
        assert_eq!(tuple.checkpoint.id, "cp1");
    }

    #[tokio::test]
    async fn fork_preserves_frontier_and_writes() {
        let saver = InMemorySaver::new();
        let config = CheckpointConfig::for_lineage("lin");
        saver
            .put_full(PutFullRequest {
                config: config.clone(),
                checkpoint: checkpoint("src", None),
                metadata: CheckpointMetadata {
                    source: CheckpointSource::Loop,
                    step: 2,
                },
                pending_writes: vec![PendingWrite {
                    channel: "branch:to:worker".to_string(),
                    value: json!(null),
                    task_id: "t1".to_string(),
                    sequence: 1,
                }],
            })
            .await
            .unwrap();

        let fork_config = fork(&saver, &config).await.unwrap();
        assert_ne!(fork_config.checkpoint_id.as_deref(), Some("src"));

        let tuple = saver.get_tuple(&fork_config).await.unwrap().unwrap();
        assert_eq!(tuple.checkpoint.parent_id.as_deref(), Some("src"));
        assert_eq!(tuple.checkpoint.next_nodes, vec!["worker"]);
        assert_eq!(tuple.pending_writes.len(), 1);
        assert_eq!(tuple.metadata.step, 2);
        assert_eq!(tuple.metadata.source, CheckpointSource::Fork);
        assert_eq!(saver.history_len("lin"), 2);
    }

    #[test]
    fn config_reads_flat_and_configurable() {
        let nested = CheckpointConfig::from_value(&json!({
            "configurable": {
                "lineage_id": "lin",
                "checkpoint_ns": "agent",
                "resume_map": {"confirm": true}
            }
        }));
        assert_eq!(nested.lineage_id.as_deref(), Some("lin"));
        assert_eq!(nested.checkpoint_ns, "agent");
        assert_eq!(
            nested.resume_map.unwrap().get("confirm"),
            Some(&json!(true))
        );
    }
}
