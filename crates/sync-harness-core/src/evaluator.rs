//! Expression evaluator seams.
//!
//! The orchestrator filters objects with a [`ConditionEvaluator`] and the
//! transform engine renders non-path mapping values with a
//! [`TemplateEvaluator`]. Both are opaque capabilities: the native app plugs
//! in a Lua implementation, tests plug in closures or [`PathTemplates`].

use anyhow::{anyhow, bail, Result};
use serde_json::Value;

use crate::mapping::dot;

/// Decides whether a source object is in scope for a synchronization.
pub trait ConditionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, object: &Value) -> Result<bool>;
}

impl<F> ConditionEvaluator for F
where
    F: Fn(&str, &Value) -> Result<bool> + Send + Sync,
{
    fn evaluate(&self, expression: &str, object: &Value) -> Result<bool> {
        self(expression, object)
    }
}

/// Renders a template expression against a document.
pub trait TemplateEvaluator: Send + Sync {
    fn render(&self, template: &str, context: &Value) -> Result<Value>;
}

/// Used when no condition evaluator was configured: any expression is an error.
pub struct NoConditions;

impl ConditionEvaluator for NoConditions {
    fn evaluate(&self, expression: &str, _object: &Value) -> Result<bool> {
        bail!(
            "no condition evaluator configured for expression '{}'",
            expression
        )
    }
}

/// Returns true when `s` contains template delimiters.
pub fn is_template(s: &str) -> bool {
    s.contains("{{") || s.contains("{%")
}

/// Split a template into literal text and `{{ ... }}` expression segments.
///
/// Returns an error on an unterminated `{{`.
pub fn split_template(template: &str) -> Result<Vec<Segment<'_>>> {
    let mut segments = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        if start > 0 {
            segments.push(Segment::Text(&rest[..start]));
        }
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| anyhow!("unterminated '{{{{' in template '{}'", template))?;
        segments.push(Segment::Expr(after[..end].trim()));
        rest = &after[end + 2..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest));
    }
    Ok(segments)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment<'a> {
    Text(&'a str),
    Expr(&'a str),
}

/// Stringify a rendered value for interpolation into surrounding text.
pub fn interpolate(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Built-in `{{ dot.path }}` interpolation with no scripting.
///
/// A template consisting of exactly one expression yields the raw value at
/// that path; anything else renders to a string. Unknown paths are errors.
#[derive(Debug, Default, Clone, Copy)]
pub struct PathTemplates;

impl TemplateEvaluator for PathTemplates {
    fn render(&self, template: &str, context: &Value) -> Result<Value> {
        let segments = split_template(template)?;
        let lookup = |path: &str| {
            dot::get(context, path)
                .cloned()
                .ok_or_else(|| anyhow!("unknown path '{}'", path))
        };

        if let [Segment::Expr(path)] = segments.as_slice() {
            return lookup(*path);
        }

        let mut out = String::new();
        for segment in segments {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Expr(path) => out.push_str(&interpolate(&lookup(path)?)),
            }
        }
        Ok(Value::String(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_template() {
        let segments = split_template("Hi {{ user.name }}!").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::Text("Hi "),
                Segment::Expr("user.name"),
                Segment::Text("!")
            ]
        );
        assert!(split_template("broken {{ x").is_err());
    }

    #[test]
    fn test_path_templates_single_expression_keeps_type() {
        let ctx = json!({ "user": { "tags": ["a", "b"], "name": "Ann" } });
        let rendered = PathTemplates.render("{{ user.tags }}", &ctx).unwrap();
        assert_eq!(rendered, json!(["a", "b"]));
    }

    #[test]
    fn test_path_templates_interpolates() {
        let ctx = json!({ "first": "Ann", "age": 30 });
        let rendered = PathTemplates.render("{{first}} is {{ age }}", &ctx).unwrap();
        assert_eq!(rendered, json!("Ann is 30"));
        assert!(PathTemplates.render("{{ nope }}", &ctx).is_err());
    }

    #[test]
    fn test_closure_condition_evaluator() {
        let eval = |_expr: &str, obj: &Value| -> Result<bool> { Ok(obj["active"] == json!(true)) };
        assert!(eval.evaluate("active", &json!({ "active": true })).unwrap());
        assert!(!eval.evaluate("active", &json!({ "active": false })).unwrap());
        assert!(NoConditions.evaluate("x", &json!({})).is_err());
    }
}
