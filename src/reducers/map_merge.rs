use serde_json::Value;

use super::Reducer;

/// Shallow map union; keys from the update win. A non-object on either side
/// degrades to overwrite.
pub struct MapMerge;

impl Reducer for MapMerge {
    fn apply(&self, current: Option<Value>, update: Value) -> Value {
        match (current, update) {
            (Some(Value::Object(mut base)), Value::Object(incoming)) => {
                for (key, value) in incoming {
                    base.insert(key, value);
                }
                Value::Object(base)
            }
            (_, update) => update,
        }
    }
}
