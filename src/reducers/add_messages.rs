use serde_json::Value;

use super::Reducer;

/// Appends message records to a history list.
///
/// Accepts either a single message object or a list of messages as the
/// update, so node code can return `{"__messages__": msg}` without wrapping.
pub struct AddMessages;

impl Reducer for AddMessages {
    fn apply(&self, current: Option<Value>, update: Value) -> Value {
        let mut history = match current {
            Some(Value::Array(items)) => items,
            Some(other) => vec![other],
            None => Vec::new(),
        };
        match update {
            Value::Array(messages) => history.extend(messages),
            message => history.push(message),
        }
        Value::Array(history)
    }
}
