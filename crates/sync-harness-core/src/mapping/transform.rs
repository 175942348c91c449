use serde_json::{Map, Value};

use super::{cast, dot, Mapping, MappingExpr};
use crate::error::TransformError;
use crate::evaluator::TemplateEvaluator;

/// Output key that, when it is the only key left, replaces the whole output.
pub const ROOT_KEY: &str = "#";
/// List-mode input key holding the entries collection.
pub const LIST_ENTRIES_KEY: &str = "listInput";
/// List-mode input key holding fields shared by every entry.
pub const LIST_EXTRA_KEY: &str = "extraValues";

/// Apply `mapping` to `input`.
///
/// Missing dotted input paths are skipped; a missing single-segment path
/// yields its own text, the way an undelimited template renders as itself. In list mode the entries are read from
/// `listInput` (or the input itself when that key is absent), each merged with
/// `extraValues`, and mapped one by one; the result keeps the input's shape
/// (array in, array out; object in, object out with the same keys).
pub fn transform(
    mapping: &Mapping,
    input: &Value,
    as_list: bool,
    templates: &dyn TemplateEvaluator,
) -> Result<Value, TransformError> {
    if !as_list {
        return transform_one(mapping, input, templates);
    }

    let entries = input.get(LIST_ENTRIES_KEY).unwrap_or(input);
    let extra = input.get(LIST_EXTRA_KEY).and_then(Value::as_object);
    let merge = |entry: &Value| match (extra, entry) {
        (Some(shared), Value::Object(own)) => {
            let mut merged = shared.clone();
            for (k, v) in own {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        _ => entry.clone(),
    };

    match entries {
        Value::Array(items) => items
            .iter()
            .map(|entry| transform_one(mapping, &merge(entry), templates))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, entry) in map {
                out.insert(key.clone(), transform_one(mapping, &merge(entry), templates)?);
            }
            Ok(Value::Object(out))
        }
        other => Err(TransformError::NotAList {
            found: dot::type_name(other).to_string(),
        }),
    }
}

fn transform_one(
    mapping: &Mapping,
    input: &Value,
    templates: &dyn TemplateEvaluator,
) -> Result<Value, TransformError> {
    let input = dot::sanitize_keys(input.clone());
    let mut output = if mapping.pass_through {
        input.clone()
    } else {
        Value::Object(Map::new())
    };

    for rule in &mapping.rules {
        let value = match &rule.expr {
            MappingExpr::Path(path) => match dot::get(&input, path) {
                Some(v) => v.clone(),
                // A bare word absent from the input is a constant
                None if !path.contains('.') => Value::String(path.clone()),
                None => continue,
            },
            MappingExpr::Template(template) => {
                templates
                    .render(template, &input)
                    .map_err(|e| TransformError::Template {
                        key: rule.key.clone(),
                        message: format!("{:#}", e),
                    })?
            }
            MappingExpr::Literal(v) => v.clone(),
        };
        dot::set(&mut output, &rule.key, value);
    }

    for path in &mapping.unset {
        dot::remove(&mut output, path);
    }

    for (key, casts) in &mapping.casts {
        cast::apply_casts(&mut output, key, casts);
    }

    let output = dot::restore_keys(output);
    Ok(unwrap_root(output))
}

fn unwrap_root(output: Value) -> Value {
    match output {
        Value::Object(mut map) if map.len() == 1 && map.contains_key(ROOT_KEY) => {
            map.shift_remove(ROOT_KEY).unwrap_or(Value::Null)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::PathTemplates;
    use crate::mapping::MappingDefinition;
    use serde_json::json;

    fn compile(def: Value) -> Mapping {
        let def: MappingDefinition = serde_json::from_value(def).unwrap();
        Mapping::compile("test", &def).unwrap()
    }

    fn apply(def: Value, input: Value) -> Value {
        transform(&compile(def), &input, false, &PathTemplates).unwrap()
    }

    #[test]
    fn test_copies_nested_path() {
        let out = apply(
            json!({ "mapping": { "name": "user.name" } }),
            json!({ "user": { "name": "Ann" } }),
        );
        assert_eq!(out, json!({ "name": "Ann" }));
    }

    #[test]
    fn test_cast_after_mapping() {
        let out = apply(
            json!({ "mapping": { "active": "active" }, "cast": { "active": ["bool"] } }),
            json!({ "active": "yes" }),
        );
        assert_eq!(out, json!({ "active": true }));
    }

    #[test]
    fn test_unset_with_pass_through() {
        let out = apply(
            json!({ "unset": ["user"], "passThrough": true }),
            json!({ "user": { "name": "Ann" }, "id": 1, "tags": ["x"] }),
        );
        assert_eq!(out, json!({ "id": 1, "tags": ["x"] }));
    }

    #[test]
    fn test_root_unwrap() {
        let out = apply(
            json!({ "mapping": { "#": "user" } }),
            json!({ "user": ["a", "b"] }),
        );
        assert_eq!(out, json!(["a", "b"]));
    }

    #[test]
    fn test_root_key_not_unwrapped_with_siblings() {
        let out = apply(
            json!({ "mapping": { "#": "a", "b": "b" } }),
            json!({ "a": 1, "b": 2 }),
        );
        assert_eq!(out, json!({ "#": 1, "b": 2 }));
    }

    #[test]
    fn test_missing_path_is_skipped() {
        let out = apply(
            json!({ "mapping": { "a": "nope.deeper", "b": "b" } }),
            json!({ "b": 2 }),
        );
        assert_eq!(out, json!({ "b": 2 }));
    }

    #[test]
    fn test_bare_word_missing_from_input_is_constant() {
        let out = apply(
            json!({ "mapping": { "type": "person", "version": "1", "name": "name" } }),
            json!({ "name": "Ann" }),
        );
        assert_eq!(out, json!({ "type": "person", "version": "1", "name": "Ann" }));

        // Present in the input: copied, not constant
        let out = apply(json!({ "mapping": { "kind": "type" } }), json!({ "type": "org" }));
        assert_eq!(out, json!({ "kind": "org" }));
    }

    #[test]
    fn test_indexed_output_keys_build_arrays() {
        let out = apply(
            json!({ "mapping": { "list.0": "a", "list.1": "b", "pair.0.x": "a" } }),
            json!({ "a": 1, "b": 2 }),
        );
        assert_eq!(out, json!({ "list": [1, 2], "pair": [ { "x": 1 } ] }));
    }

    #[test]
    fn test_pass_through_preserves_dotted_keys() {
        let input = json!({ "a.b": { "c.d": 1 }, "plain": [ { "x.y": null } ] });
        let out = apply(json!({ "passThrough": true }), input.clone());
        assert_eq!(out, input);
    }

    #[test]
    fn test_template_and_literal_values() {
        let out = apply(
            json!({ "mapping": {
                "greeting": "Hello {{ user.name }}",
                "tags": "{{ user.tags }}",
                "kind": "a person",
                "version": 2
            } }),
            json!({ "user": { "name": "Ann", "tags": ["a"] } }),
        );
        assert_eq!(
            out,
            json!({ "greeting": "Hello Ann", "tags": ["a"], "kind": "a person", "version": 2 })
        );
    }

    #[test]
    fn test_template_failure_is_an_error() {
        let mapping = compile(json!({ "mapping": { "x": "{{ missing }}" } }));
        let err = transform(&mapping, &json!({}), false, &PathTemplates).unwrap_err();
        assert!(matches!(err, TransformError::Template { ref key, .. } if key == "x"));
    }

    #[test]
    fn test_mapping_is_pure() {
        let mapping = compile(json!({
            "mapping": { "n": "a", "list.0": "b" },
            "cast": { "n": "int" }
        }));
        let input = json!({ "a": "5", "b": "x" });
        let first = transform(&mapping, &input, false, &PathTemplates).unwrap();
        let second = transform(&mapping, &input, false, &PathTemplates).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, json!({ "n": 5, "list": ["x"] }));
    }

    #[test]
    fn test_list_mode_array_input() {
        let mapping = compile(json!({ "mapping": { "name": "name", "org": "org" } }));
        let input = json!({
            "listInput": [ { "name": "a" }, { "name": "b", "org": "own" } ],
            "extraValues": { "org": "shared" }
        });
        let out = transform(&mapping, &input, true, &PathTemplates).unwrap();
        assert_eq!(
            out,
            json!([ { "name": "a", "org": "shared" }, { "name": "b", "org": "own" } ])
        );
    }

    #[test]
    fn test_list_mode_keyed_input() {
        let mapping = compile(json!({ "mapping": { "v": "v" } }));
        let input = json!({ "second": { "v": 2 }, "first": { "v": 1 } });
        let out = transform(&mapping, &input, true, &PathTemplates).unwrap();
        let keys: Vec<_> = out.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["second", "first"]);
        assert_eq!(out["first"], json!({ "v": 1 }));
    }

    #[test]
    fn test_list_mode_rejects_scalar() {
        let mapping = compile(json!({}));
        let err = transform(&mapping, &json!({ "listInput": 3 }), true, &PathTemplates).unwrap_err();
        assert_eq!(err, TransformError::NotAList { found: "number".into() });
    }
}
