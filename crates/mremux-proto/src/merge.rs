//! Deep-merge semantics for world-state updates.
//!
//! The rules are fixed so every peer converges on the same state:
//! objects merge key by key and recurse, arrays in the update replace
//! arrays in the target wholesale, and any other value (including
//! `null`) overwrites. Keys absent from the update never clobber.

use serde_json::Value;

/// Merge `update` into `target` in place.
pub fn merge_value(target: &mut Value, update: &Value) {
    match (target, update) {
        (Value::Object(target_map), Value::Object(update_map)) => {
            for (key, value) in update_map {
                match target_map.get_mut(key) {
                    Some(slot) if slot.is_object() && value.is_object() => {
                        merge_value(slot, value);
                    }
                    Some(slot) => *slot = value.clone(),
                    None => {
                        target_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, update) => *target = update.clone(),
    }
}

/// Owned variant of [`merge_value`].
pub fn merged(mut base: Value, update: &Value) -> Value {
    merge_value(&mut base, update);
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn objects_recurse_and_keep_unmentioned_keys() {
        let mut target = json!({"a": {"x": 1, "y": 2}, "b": true});
        merge_value(&mut target, &json!({"a": {"y": 3, "z": 4}}));
        assert_eq!(target, json!({"a": {"x": 1, "y": 3, "z": 4}, "b": true}));
    }

    #[test]
    fn arrays_replace_wholesale() {
        let mut target = json!({"tags": [1, 2, 3]});
        merge_value(&mut target, &json!({"tags": [9]}));
        assert_eq!(target, json!({"tags": [9]}));
    }

    #[test]
    fn primitives_and_null_overwrite() {
        let mut target = json!({"a": 1, "b": "keep"});
        merge_value(&mut target, &json!({"a": null}));
        assert_eq!(target, json!({"a": null, "b": "keep"}));
    }

    #[test]
    fn object_overwrites_scalar_and_vice_versa() {
        let mut target = json!({"a": 1});
        merge_value(&mut target, &json!({"a": {"nested": true}}));
        assert_eq!(target, json!({"a": {"nested": true}}));

        let mut target = json!({"a": {"nested": true}});
        merge_value(&mut target, &json!({"a": 7}));
        assert_eq!(target, json!({"a": 7}));
    }

    #[test]
    fn merge_is_idempotent_per_update() {
        let update = json!({"transform": {"local": {"position": {"x": 1.0}}}, "tags": ["t"]});
        let once = merged(json!({"transform": {"app": {"position": {"x": 0.0}}}}), &update);
        let twice = merged(once.clone(), &update);
        assert_eq!(once, twice);
    }
}
