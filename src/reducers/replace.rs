use serde_json::Value;

use super::Reducer;

/// Last-write-wins reducer. The default for fields without special merge
/// semantics.
pub struct Replace;

impl Reducer for Replace {
    fn apply(&self, _current: Option<Value>, update: Value) -> Value {
        update
    }
}
