//! Declarative mapping recipes.
//!
//! A [`MappingDefinition`] is the operator-facing shape (as read from
//! configuration). [`Mapping::compile`] turns it into a [`Mapping`] whose
//! values are already classified as [`MappingExpr`]s and whose casts are
//! parsed, so applying it ([`transform`]) never inspects strings to decide
//! what they mean.

pub mod cast;
pub mod dot;
mod transform;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use cast::Cast;
pub use transform::{transform, LIST_ENTRIES_KEY, LIST_EXTRA_KEY, ROOT_KEY};

use crate::error::TransformError;
use crate::evaluator::is_template;

/// Mapping recipe as written by an operator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingDefinition {
    /// Output dot-path → expression, in declaration order.
    #[serde(default)]
    pub mapping: Map<String, Value>,
    /// Output dot-paths removed after mapping.
    #[serde(default)]
    pub unset: Vec<String>,
    /// Output dot-path → cast operator(s), either a list or a comma-separated string.
    #[serde(default)]
    pub cast: Map<String, Value>,
    #[serde(default, alias = "pass_through")]
    pub pass_through: bool,
}

/// How one output value is produced.
#[derive(Debug, Clone, PartialEq)]
pub enum MappingExpr {
    /// Copy the value at this dot-path of the input. When absent, a dotted
    /// path is skipped and a single segment is emitted as its own text.
    Path(String),
    /// Render through the template evaluator against the whole input.
    Template(String),
    /// Constant value.
    Literal(Value),
}

impl MappingExpr {
    /// Classify a raw mapping value.
    pub fn classify(raw: &Value) -> Self {
        match raw {
            Value::String(s) if is_template(s) => MappingExpr::Template(s.clone()),
            Value::String(s) if looks_like_path(s) => MappingExpr::Path(s.clone()),
            other => MappingExpr::Literal(other.clone()),
        }
    }
}

fn looks_like_path(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('.')
        && !s.ends_with('.')
        && !s.contains("..")
        && s.chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '#' | '@' | '$' | '&' | ';'))
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappingRule {
    pub key: String,
    pub expr: MappingExpr,
}

/// A compiled, immutable mapping recipe.
#[derive(Debug, Clone, PartialEq)]
pub struct Mapping {
    pub id: String,
    pub rules: Vec<MappingRule>,
    pub unset: Vec<String>,
    pub casts: Vec<(String, Vec<Cast>)>,
    pub pass_through: bool,
}

impl Mapping {
    /// Validate and classify a definition. Fails on malformed cast operators.
    pub fn compile(id: &str, definition: &MappingDefinition) -> Result<Self, TransformError> {
        let rules = definition
            .mapping
            .iter()
            .map(|(key, raw)| MappingRule {
                key: key.clone(),
                expr: MappingExpr::classify(raw),
            })
            .collect();

        let mut casts = Vec::with_capacity(definition.cast.len());
        for (key, spec) in &definition.cast {
            casts.push((key.clone(), parse_cast_list(key, spec)?));
        }

        Ok(Self {
            id: id.to_string(),
            rules,
            unset: definition.unset.clone(),
            casts,
            pass_through: definition.pass_through,
        })
    }

    /// Mapping that copies its input unchanged.
    pub fn identity(id: &str) -> Self {
        Self {
            id: id.to_string(),
            rules: Vec::new(),
            unset: Vec::new(),
            casts: Vec::new(),
            pass_through: true,
        }
    }
}

fn parse_cast_list(key: &str, spec: &Value) -> Result<Vec<Cast>, TransformError> {
    let invalid = |message: &str| TransformError::InvalidCast {
        key: key.to_string(),
        cast: spec.to_string(),
        message: message.to_string(),
    };

    match spec {
        Value::String(s) => s
            .split(',')
            .filter(|part| !part.trim().is_empty())
            .map(|part| Cast::parse(key, part))
            .collect(),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Cast::parse(key, s),
                _ => Err(invalid("cast operators must be strings")),
            })
            .collect(),
        _ => Err(invalid("expected a string or a list of strings")),
    }
}
