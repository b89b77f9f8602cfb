//! State management for graph runs.
//!
//! A run's state is an unordered mapping from string keys to opaque JSON
//! values. Updates pass through a [`StateSchema`] when one is attached to
//! the graph: the schema names the expected kind of each field, the reducer
//! that merges updates into it, an optional default, and whether the field
//! must exist after restoration.
//!
//! Task inputs are deep copies of the live state with the unsafe keys
//! removed (see [`crate::types::UNSAFE_KEYS`]); engine handles travel on the
//! task context instead of inside the map.
//!
//! # Examples
//!
//! ```
//! use graphflow::state::{FieldKind, State, StateField, StateSchema};
//! use serde_json::json;
//!
//! let schema = StateSchema::new()
//!     .field("counter", StateField::new(FieldKind::Integer))
//!     .field(
//!         "items",
//!         StateField::new(FieldKind::List)
//!             .with_reducer(std::sync::Arc::new(graphflow::reducers::Append))
//!             .with_default(json!([])),
//!     );
//!
//! let mut state = State::new();
//! schema.initialize(&mut state);
//! assert_eq!(state.get("items"), Some(&json!([])));
//!
//! schema.apply_update(&mut state, State::from_values(
//!     [("items".to_string(), json!(["first"]))].into_iter().collect(),
//! ));
//! schema.apply_update(&mut state, State::from_values(
//!     [("items".to_string(), json!(["second"]))].into_iter().collect(),
//! ));
//! assert_eq!(state.get("items"), Some(&json!(["first", "second"])));
//! ```

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::reducers::{Reducer, Replace};
use crate::types::is_unsafe_key;

/// The shared state of a run: string keys to opaque JSON values.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct State {
    values: FxHashMap<String, Value>,
}

impl State {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing value map.
    #[must_use]
    pub fn from_values(values: FxHashMap<String, Value>) -> Self {
        Self { values }
    }

    /// Fluent insertion, useful when constructing initial states.
    ///
    /// ```
    /// use graphflow::state::State;
    /// use serde_json::json;
    ///
    /// let state = State::new()
    ///     .with("input", json!("test data"))
    ///     .with("limit", json!(10));
    /// assert_eq!(state.len(), 2);
    /// ```
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Returns the value at `key` as a string slice, if it is a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Borrows the underlying value map.
    #[must_use]
    pub fn values(&self) -> &FxHashMap<String, Value> {
        &self.values
    }

    /// Consumes the state, returning the underlying value map.
    #[must_use]
    pub fn into_values(self) -> FxHashMap<String, Value> {
        self.values
    }

    /// Deep copy with the unsafe keys removed.
    ///
    /// This is the copy handed to tasks and the shape serialized into
    /// checkpoints and completion snapshots.
    #[must_use]
    pub fn sanitized_clone(&self) -> State {
        State {
            values: self
                .values
                .iter()
                .filter(|(key, _)| !is_unsafe_key(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        }
    }

    /// JSON-serializable snapshot of the state, skipping unsafe keys.
    #[must_use]
    pub fn json_snapshot(&self) -> FxHashMap<String, Value> {
        self.sanitized_clone().into_values()
    }
}

impl FromIterator<(String, Value)> for State {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Expected concrete kind of a state field.
///
/// The kind drives type coercion when values come back from a persisted
/// checkpoint and supplies the zero value materialized for required fields
/// without a default.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// No expectation; values pass through untouched.
    #[default]
    Any,
    Bool,
    Integer,
    Float,
    String,
    List,
    Map,
    /// A list of message records; single objects are wrapped on coercion.
    Messages,
}

impl FieldKind {
    /// Best-effort coercion of a restored value to this kind.
    ///
    /// Values already of the right shape pass through. The only lossy case
    /// handled is integral floats arriving where an integer is declared,
    /// which JSON round-trips produce routinely. Anything else is returned
    /// unchanged rather than guessed at.
    #[must_use]
    pub fn coerce(&self, value: Value) -> Value {
        match self {
            FieldKind::Integer => match value {
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Value::from(i)
                    } else if let Some(f) = n.as_f64() {
                        if f.fract() == 0.0 {
                            Value::from(f as i64)
                        } else {
                            Value::Number(n)
                        }
                    } else {
                        Value::Number(n)
                    }
                }
                other => other,
            },
            FieldKind::Float => match value {
                Value::Number(n) => n.as_f64().map(Value::from).unwrap_or(Value::Number(n)),
                other => other,
            },
            FieldKind::Messages => match value {
                Value::Array(items) => Value::Array(items),
                Value::Null => Value::Array(Vec::new()),
                single => Value::Array(vec![single]),
            },
            _ => value,
        }
    }

    /// The zero value for this kind.
    #[must_use]
    pub fn zero(&self) -> Value {
        match self {
            FieldKind::Any => Value::Null,
            FieldKind::Bool => Value::Bool(false),
            FieldKind::Integer => Value::from(0),
            FieldKind::Float => Value::from(0.0),
            FieldKind::String => Value::String(String::new()),
            FieldKind::List | FieldKind::Messages => Value::Array(Vec::new()),
            FieldKind::Map => Value::Object(serde_json::Map::new()),
        }
    }
}

/// Declaration of a single state field: kind, reducer, default, requiredness.
#[derive(Clone)]
pub struct StateField {
    kind: FieldKind,
    reducer: Arc<dyn Reducer>,
    default: Option<Value>,
    required: bool,
}

impl StateField {
    /// Creates a field of the given kind with the overwrite reducer.
    #[must_use]
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            reducer: Arc::new(Replace),
            default: None,
            required: false,
        }
    }

    /// Replaces the merge strategy for this field.
    #[must_use]
    pub fn with_reducer(mut self, reducer: Arc<dyn Reducer>) -> Self {
        self.reducer = reducer;
        self
    }

    /// Sets the default materialized at initialization and restoration.
    #[must_use]
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Marks the field as required; its zero value is materialized on
    /// restore when neither the checkpoint nor a default provides one.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    #[must_use]
    pub fn default_value(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    #[must_use]
    pub fn is_required(&self) -> bool {
        self.required
    }
}

impl std::fmt::Debug for StateField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateField")
            .field("kind", &self.kind)
            .field("default", &self.default)
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}

/// Field declarations governing how state updates merge.
///
/// Fields not declared here are overwritten on update and pass through
/// restoration untouched.
#[derive(Clone, Debug, Default)]
pub struct StateSchema {
    fields: FxHashMap<String, StateField>,
}

impl StateSchema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a field, replacing any previous declaration for the key.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, field: StateField) -> Self {
        self.fields.insert(name.into(), field);
        self
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&StateField> {
        self.fields.get(name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Materializes defaults for declared fields missing from the state.
    pub fn initialize(&self, state: &mut State) {
        for (name, field) in &self.fields {
            if !state.contains_key(name) {
                if let Some(default) = &field.default {
                    state.insert(name.clone(), default.clone());
                }
            }
        }
    }

    /// Merges an update into the state.
    ///
    /// Declared fields go through their reducer; unknown fields overwrite.
    /// Unsafe keys are dropped outright. Returns the keys that were written,
    /// sorted for deterministic event payloads.
    pub fn apply_update(&self, state: &mut State, update: State) -> Vec<String> {
        let mut updated: Vec<String> = Vec::with_capacity(update.len());
        for (key, value) in update.into_values() {
            if is_unsafe_key(&key) {
                continue;
            }
            let merged = match self.fields.get(&key) {
                Some(field) => field.reducer.apply(state.get(&key).cloned(), value),
                None => value,
            };
            state.insert(key.clone(), merged);
            updated.push(key);
        }
        updated.sort();
        updated
    }

    /// Rebuilds a state from persisted checkpoint values.
    ///
    /// Every declared field ends up present: a persisted value is coerced to
    /// the declared kind, otherwise the default is materialized, otherwise
    /// the kind's zero value. Undeclared persisted keys are carried through
    /// as-is (minus unsafe keys).
    #[must_use]
    pub fn restore(&self, mut raw: FxHashMap<String, Value>) -> State {
        let mut state = State::new();
        for (name, field) in &self.fields {
            let value = match raw.remove(name) {
                Some(value) => field.kind.coerce(value),
                None => field
                    .default
                    .clone()
                    .unwrap_or_else(|| field.kind.zero()),
            };
            state.insert(name.clone(), value);
        }
        for (key, value) in raw {
            if !is_unsafe_key(&key) {
                state.insert(key, value);
            }
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reducers::{Append, MapMerge};
    use serde_json::json;

    fn schema() -> StateSchema {
        StateSchema::new()
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
            )
            .field("label", StateField::new(FieldKind::String).required())
    }

    #[test]
    fn initialize_materializes_defaults_only() {
        let mut state = State::new();
        schema().initialize(&mut state);
        assert_eq!(state.get("items"), Some(&json!([])));
        assert_eq!(state.get("metadata"), Some(&json!({})));
        assert!(state.get("counter").is_none());
        assert!(state.get("label").is_none());
    }

    #[test]
    fn apply_update_routes_through_reducers() {
        let schema = schema();
        let mut state = State::new();
        schema.initialize(&mut state);

        let first = schema.apply_update(
            &mut state,
            State::new()
                .with("counter", json!(1))
                .with("items", json!(["item1"]))
                .with("metadata", json!({"step": "1"})),
        );
        assert_eq!(first, vec!["counter", "items", "metadata"]);

        schema.apply_update(
            &mut state,
            State::new()
                .with("counter", json!(2))
                .with("items", json!(["item2"]))
                .with("metadata", json!({"step": "2", "extra": "data"})),
        );

        assert_eq!(state.get("counter"), Some(&json!(2)));
        assert_eq!(state.get("items"), Some(&json!(["item1", "item2"])));
        assert_eq!(
            state.get("metadata"),
            Some(&json!({"step": "2", "extra": "data"}))
        );
    }

    #[test]
    fn apply_update_drops_unsafe_keys() {
        let schema = StateSchema::new();
        let mut state = State::new();
        let updated = schema.apply_update(
            &mut state,
            State::new()
                .with(crate::types::KEY_SESSION, json!("handle"))
                .with("ok", json!(true)),
        );
        assert_eq!(updated, vec!["ok"]);
        assert!(!state.contains_key(crate::types::KEY_SESSION));
    }

    #[test]
    fn restore_coerces_defaults_and_zeroes() {
        let schema = schema();
        let mut raw = FxHashMap::default();
        raw.insert("counter".to_string(), json!(3.0));
        raw.insert("loose".to_string(), json!("kept"));

        let state = schema.restore(raw);
        assert_eq!(state.get("counter"), Some(&json!(3)));
        assert_eq!(state.get("items"), Some(&json!([])));
        assert_eq!(state.get("metadata"), Some(&json!({})));
        assert_eq!(state.get("label"), Some(&json!("")));
        assert_eq!(state.get("loose"), Some(&json!("kept")));
    }

    #[test]
    fn sanitized_clone_skips_unsafe_keys() {
        let state = State::new()
            .with("data", json!(1))
            .with(crate::types::KEY_EXEC_CONTEXT, json!("ptr"));
        let copy = state.sanitized_clone();
        assert!(copy.contains_key("data"));
        assert!(!copy.contains_key(crate::types::KEY_EXEC_CONTEXT));
    }
}
