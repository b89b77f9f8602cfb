use serde_json::Value;

use super::Reducer;

/// Concatenates sequences. Non-array operands are treated as single-element
/// sequences so a node can contribute one item without wrapping it.
pub struct Append;

impl Reducer for Append {
    fn apply(&self, current: Option<Value>, update: Value) -> Value {
        let mut items = match current {
            Some(Value::Array(items)) => items,
            Some(other) => vec![other],
            None => Vec::new(),
        };
        match update {
            Value::Array(new_items) => items.extend(new_items),
            other => items.push(other),
        }
        Value::Array(items)
    }
}
