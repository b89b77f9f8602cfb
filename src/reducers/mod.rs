//! State merge strategies.
//!
//! A [`Reducer`] defines how a node's update for a single state field is
//! merged into the current value. The schema assigns one reducer per field;
//! fields without a schema entry are overwritten.
//!
//! Standard reducers:
//! - [`Replace`] — last write wins (the default)
//! - [`Append`] — concatenate sequences
//! - [`MapMerge`] — shallow map union, right side wins
//! - [`AddMessages`] — append message records, accepting a single message or
//!   a list

mod add_messages;
mod append;
mod map_merge;
mod replace;

pub use add_messages::AddMessages;
pub use append::Append;
pub use map_merge::MapMerge;
pub use replace::Replace;

use serde_json::Value;

/// Merges an update into the current value of a state field.
///
/// Reducers must be pure: `merged = reducer(current, update)` with no side
/// effects, so replays and concurrent-task merges stay deterministic. Fields
/// written by concurrent tasks in the same step need a commutative reducer
/// (or disjoint writers).
pub trait Reducer: Send + Sync {
    /// Returns the merged value. `current` is `None` when the field has
    /// never been written.
    fn apply(&self, current: Option<Value>, update: Value) -> Value;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replace_overwrites() {
        assert_eq!(Replace.apply(Some(json!(1)), json!(2)), json!(2));
        assert_eq!(Replace.apply(None, json!("x")), json!("x"));
    }

    #[test]
    fn append_concatenates_sequences() {
        let merged = Append.apply(Some(json!(["a"])), json!(["b", "c"]));
        assert_eq!(merged, json!(["a", "b", "c"]));
    }

    #[test]
    fn append_wraps_scalars() {
        let merged = Append.apply(Some(json!(["a"])), json!("b"));
        assert_eq!(merged, json!(["a", "b"]));
        assert_eq!(Append.apply(None, json!("solo")), json!(["solo"]));
    }

    #[test]
    fn map_merge_right_wins() {
        let merged = MapMerge.apply(
            Some(json!({"step": "1", "keep": true})),
            json!({"step": "2", "extra": "data"}),
        );
        assert_eq!(merged, json!({"step": "2", "keep": true, "extra": "data"}));
    }

    #[test]
    fn map_merge_non_object_overwrites() {
        assert_eq!(MapMerge.apply(Some(json!({"a": 1})), json!(7)), json!(7));
    }

    #[test]
    fn add_messages_appends_single_and_list() {
        let one = AddMessages.apply(None, json!({"role": "user", "content": "hi"}));
        assert_eq!(one, json!([{"role": "user", "content": "hi"}]));

        let two = AddMessages.apply(
            Some(one),
            json!([{"role": "assistant", "content": "hey"}]),
        );
        assert_eq!(
            two,
            json!([
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hey"}
            ])
        );
    }
}
