//! Node result caching.
//!
//! When a node carries an effective [`CachePolicy`] and the graph has a
//! [`Cache`] attached, the executor looks up the node result under a
//! node-scoped namespace before invoking the function. Cache keys are
//! computed from a sanitized view of the task input (unsafe keys removed)
//! so keys stay stable across runs; a node-level key selector can narrow
//! the input further.
//!
//! On a hit the node function and its retries are skipped, but after
//! callbacks and downstream routing still run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

use crate::state::State;

/// Errors from cache key computation or the backing store.
#[derive(Debug, Error, Diagnostic)]
pub enum CacheError {
    /// The key function rejected the input.
    #[error("cache key computation failed: {message}")]
    #[diagnostic(code(graphflow::cache::key))]
    KeyFunction { message: String },

    /// Backend storage failure.
    #[error("cache backend error: {message}")]
    #[diagnostic(code(graphflow::cache::backend))]
    Backend { message: String },

    /// Cached payloads are JSON; (de)serialization failures land here.
    #[error(transparent)]
    #[diagnostic(code(graphflow::cache::serde))]
    Serde(#[from] serde_json::Error),
}

/// External cache interface. Implementations are treated as black boxes;
/// the engine serializes calls per run but assumes nothing across runs.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, namespace: &str, key: &[u8]) -> Result<Option<Value>, CacheError>;
    async fn set(
        &self,
        namespace: &str,
        key: &[u8],
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError>;
}

/// Computes cache key bytes from a task input.
pub type CacheKeyFn = Arc<dyn Fn(&State) -> Result<Vec<u8>, CacheError> + Send + Sync>;

/// Narrows the key input before key computation.
pub type CacheKeySelector = Arc<dyn Fn(&State) -> Value + Send + Sync>;

/// Cache namespace scoped to one node.
#[must_use]
pub fn node_namespace(node_id: &str) -> String {
    format!("node:{node_id}")
}

/// Canonical key bytes for a task input: the sanitized state serialized with
/// sorted keys, so hashing is independent of map iteration order.
pub fn default_cache_key(input: &State) -> Result<Vec<u8>, CacheError> {
    let sanitized = input.sanitized_clone();
    let ordered: BTreeMap<&String, &Value> = sanitized.values().iter().collect();
    Ok(serde_json::to_vec(&ordered)?)
}

/// How a node's results are cached.
#[derive(Clone)]
pub struct CachePolicy {
    key_fn: CacheKeyFn,
    /// Entry lifetime; `None` means no expiry.
    pub ttl: Option<Duration>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl CachePolicy {
    /// Policy using [`default_cache_key`] and no expiry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            key_fn: Arc::new(default_cache_key),
            ttl: None,
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Replaces the key function.
    #[must_use]
    pub fn with_key_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&State) -> Result<Vec<u8>, CacheError> + Send + Sync + 'static,
    {
        self.key_fn = Arc::new(f);
        self
    }

    /// Computes the key for a task input.
    pub fn key(&self, input: &State) -> Result<Vec<u8>, CacheError> {
        (self.key_fn)(input)
    }
}

impl std::fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePolicy")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

struct CacheEntry {
    value: Value,
    expires_at: Option<Instant>,
}

/// Process-local cache with TTL expiry. The in-crate reference
/// implementation, suitable for tests and single-process runs.
#[derive(Default)]
pub struct InMemoryCache {
    entries: RwLock<FxHashMap<(String, Vec<u8>), CacheEntry>>,
}

impl InMemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl Cache for InMemoryCache {
    async fn get(&self, namespace: &str, key: &[u8]) -> Result<Option<Value>, CacheError> {
        let composite = (namespace.to_string(), key.to_vec());
        {
            let entries = self.entries.read();
            match entries.get(&composite) {
                Some(entry) if entry.expires_at.is_none_or(|at| Instant::now() < at) => {
                    return Ok(Some(entry.value.clone()));
                }
                Some(_) => {}
                None => return Ok(None),
            }
        }
        // Expired; drop it lazily.
        self.entries.write().remove(&composite);
        Ok(None)
    }

    async fn set(
        &self,
        namespace: &str,
        key: &[u8],
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let entry = CacheEntry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.entries
            .write()
            .insert((namespace.to_string(), key.to_vec()), entry);
        Ok(())
    }
}
