//! Dot-notation addressing over JSON documents.
//!
//! `a.b.0.c` walks object keys and array indices. Keys that themselves
//! contain `.` are made addressable by [`sanitize_keys`], which replaces the
//! dot with [`DOT_SENTINEL`]; [`restore_keys`] undoes it.

use serde_json::{Map, Value};

/// Replacement for `.` inside key names while a document is being mapped.
pub const DOT_SENTINEL: &str = "&#46;";

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('.')
}

/// Look up the value at `path`, if every segment exists.
pub fn get<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    let mut current = root;
    for segment in segments(path) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Store `value` at `path`, creating intermediate objects as needed.
///
/// A scalar found on the way is replaced by an object, or by an array when
/// the next segment is `0`. Array segments must be
/// an existing index or the next free index (append).
pub fn set(root: &mut Value, path: &str, value: Value) {
    let parts: Vec<&str> = segments(path).collect();
    set_parts(root, &parts, value);
}

fn set_parts(current: &mut Value, parts: &[&str], value: Value) {
    let Some((head, rest)) = parts.split_first() else {
        *current = value;
        return;
    };

    // A fresh slot addressed with index 0 starts a list
    if *head == "0" && !current.is_object() && !current.is_array() {
        *current = Value::Array(Vec::new());
    }

    if let Value::Array(items) = current {
        if let Ok(index) = head.parse::<usize>() {
            if index < items.len() {
                set_parts(&mut items[index], rest, value);
                return;
            }
            if index == items.len() {
                items.push(Value::Null);
                set_parts(&mut items[index], rest, value);
                return;
            }
        }
    }

    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        let slot = map.entry(head.to_string()).or_insert(Value::Null);
        if rest.is_empty() {
            *slot = value;
        } else {
            set_parts(slot, rest, value);
        }
    }
}

/// Remove the value at `path`. Missing paths are a no-op.
pub fn remove(root: &mut Value, path: &str) -> Option<Value> {
    let (parent_path, last) = match path.rsplit_once('.') {
        Some((parent, last)) => (Some(parent), last),
        None => (None, path),
    };
    let parent = match parent_path {
        Some(p) => get_mut(root, p)?,
        None => root,
    };
    match parent {
        Value::Object(map) => map.shift_remove(last),
        Value::Array(items) => {
            let index = last.parse::<usize>().ok()?;
            (index < items.len()).then(|| items.remove(index))
        }
        _ => None,
    }
}

fn get_mut<'a>(root: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = root;
    for segment in segments(path) {
        current = match current {
            Value::Object(map) => map.get_mut(segment)?,
            Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Short JSON type name for error messages.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Recursively replace `.` in object keys with [`DOT_SENTINEL`].
pub fn sanitize_keys(value: Value) -> Value {
    rewrite_keys(value, &|k| k.replace('.', DOT_SENTINEL))
}

/// Undo [`sanitize_keys`].
pub fn restore_keys(value: Value) -> Value {
    rewrite_keys(value, &|k| k.replace(DOT_SENTINEL, "."))
}

fn rewrite_keys(value: Value, f: &dyn Fn(&str) -> String) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (f(&k), rewrite_keys(v, f)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(|v| rewrite_keys(v, f)).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_nested_and_indexed() {
        let doc = json!({ "user": { "tags": ["a", "b"], "name": "Ann" } });
        assert_eq!(get(&doc, "user.name"), Some(&json!("Ann")));
        assert_eq!(get(&doc, "user.tags.1"), Some(&json!("b")));
        assert_eq!(get(&doc, "user.tags.9"), None);
        assert_eq!(get(&doc, "user.missing"), None);
        assert_eq!(get(&doc, ""), None);
    }

    #[test]
    fn test_set_creates_intermediate_objects() {
        let mut doc = json!({});
        set(&mut doc, "a.b.c", json!(1));
        assert_eq!(doc, json!({ "a": { "b": { "c": 1 } } }));

        set(&mut doc, "a.b", json!("flat"));
        assert_eq!(doc, json!({ "a": { "b": "flat" } }));
    }

    #[test]
    fn test_set_appends_to_array() {
        let mut doc = json!({ "list": [1] });
        set(&mut doc, "list.1", json!(2));
        set(&mut doc, "list.0", json!(0));
        assert_eq!(doc, json!({ "list": [0, 2] }));
    }

    #[test]
    fn test_set_index_zero_starts_array() {
        let mut doc = json!({});
        set(&mut doc, "list.0", json!("x"));
        assert_eq!(doc, json!({ "list": ["x"] }));

        let mut doc = json!({ "list": "scalar" });
        set(&mut doc, "list.0.id", json!(1));
        assert_eq!(doc, json!({ "list": [ { "id": 1 } ] }));

        // Non-zero index on a fresh slot stays an object key
        let mut doc = json!({});
        set(&mut doc, "codes.2", json!("c"));
        assert_eq!(doc, json!({ "codes": { "2": "c" } }));
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let mut doc = json!({ "a": { "b": 1 }, "c": 2 });
        assert_eq!(remove(&mut doc, "a.x"), None);
        assert_eq!(remove(&mut doc, "nope.deeper"), None);
        assert_eq!(remove(&mut doc, "a.b"), Some(json!(1)));
        assert_eq!(doc, json!({ "a": {}, "c": 2 }));
    }

    #[test]
    fn test_remove_keeps_sibling_order() {
        let mut doc = json!({ "x": 1, "y": 2, "z": 3 });
        remove(&mut doc, "y");
        let keys: Vec<_> = doc.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["x", "z"]);
    }

    #[test]
    fn test_sanitize_round_trip() {
        let doc = json!({ "a.b": { "c.d": [ { "e.f": 1 } ] }, "plain": true });
        let sanitized = sanitize_keys(doc.clone());
        assert!(sanitized.get("a&#46;b").is_some());
        assert_eq!(get(&sanitized, "a&#46;b.c&#46;d.0.e&#46;f"), Some(&json!(1)));
        assert_eq!(restore_keys(sanitized), doc);
    }
}
