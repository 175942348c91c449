//! Lua 5.4 condition and template evaluator.
//!
//! Implements the core's [`ConditionEvaluator`] and [`TemplateEvaluator`]
//! seams with a single sandboxed VM. Every evaluation runs in a fresh
//! environment table that exposes the document being evaluated:
//!
//! | Name | Value |
//! |------|-------|
//! | `object` | the whole document |
//! | `<field>` | each top-level field of the document |
//! | `json` | `parse`, `encode` |
//!
//! Lookups that miss the environment fall through to the VM globals, so the
//! `string`, `math` and `table` libraries stay available.
//!
//! # Sandboxing
//!
//! `os`, `io`, `debug`, `loadfile` and `dofile` are removed from the globals
//! when the VM is created.
//!
//! # Example
//!
//! ```rust
//! use serde_json::json;
//! use sync_harness::lua_eval::LuaEvaluator;
//! use sync_harness_core::evaluator::{ConditionEvaluator, TemplateEvaluator};
//!
//! let lua = LuaEvaluator::new().unwrap();
//! let user = json!({ "name": "Ann", "age": 41 });
//! assert!(lua.evaluate("age > 40 and object.name == 'Ann'", &user).unwrap());
//! assert_eq!(
//!     lua.render("{{ string.upper(name) }} ({{ age }})", &user).unwrap(),
//!     json!("ANN (41)")
//! );
//! ```

use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use mlua::{Lua, Result as LuaResult, Table as LuaTable, Value as LuaValue};
use serde_json::Value;

use sync_harness_core::evaluator::{
    interpolate, split_template, ConditionEvaluator, Segment, TemplateEvaluator,
};
use sync_harness_core::fingerprint::MAX_DEPTH;

pub struct LuaEvaluator {
    lua: Mutex<Lua>,
}

impl LuaEvaluator {
    pub fn new() -> Result<Self> {
        let lua = Lua::new();
        sandbox_globals(&lua).context("Failed to sandbox Lua globals")?;
        register_json_api(&lua).context("Failed to register Lua json module")?;
        Ok(Self {
            lua: Mutex::new(lua),
        })
    }

    /// Evaluate one Lua expression with `document` bound into its environment.
    fn eval(&self, expression: &str, document: &Value) -> Result<Value> {
        let lua = self
            .lua
            .lock()
            .map_err(|_| anyhow!("Lua evaluator lock poisoned"))?;

        let env = document_env(&lua, document)
            .with_context(|| format!("Failed to expose document to '{}'", expression))?;
        let result: LuaValue = lua
            .load(format!("return {}", expression))
            .set_name(expression)
            .set_environment(env)
            .eval()
            .with_context(|| format!("Lua expression '{}' failed", expression))?;

        Ok(lua_value_to_json(result)?)
    }
}

impl ConditionEvaluator for LuaEvaluator {
    fn evaluate(&self, expression: &str, object: &Value) -> Result<bool> {
        let value = self.eval(expression, object)?;
        Ok(!matches!(value, Value::Null | Value::Bool(false)))
    }
}

impl TemplateEvaluator for LuaEvaluator {
    fn render(&self, template: &str, context: &Value) -> Result<Value> {
        let segments = split_template(template)?;
        if let [Segment::Expr(expr)] = segments.as_slice() {
            return self.eval(expr, context);
        }

        let mut out = String::new();
        for segment in segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Expr(expr) => out.push_str(&interpolate(&self.eval(expr, context)?)),
            }
        }
        Ok(Value::String(out))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Sandboxing
// ═══════════════════════════════════════════════════════════════════════

/// Remove dangerous standard library functions from the Lua globals.
fn sandbox_globals(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();
    globals.set("os", LuaValue::Nil)?;
    globals.set("io", LuaValue::Nil)?;
    globals.set("loadfile", LuaValue::Nil)?;
    globals.set("dofile", LuaValue::Nil)?;
    globals.set("debug", LuaValue::Nil)?;
    Ok(())
}

/// Build the per-evaluation environment: document fields over the globals.
fn document_env(lua: &Lua, document: &Value) -> LuaResult<LuaTable> {
    let env = lua.create_table()?;
    if let Value::Object(fields) = document {
        for (key, value) in fields {
            env.set(key.as_str(), json_value_to_lua(lua, value)?)?;
        }
    }
    env.set("object", json_value_to_lua(lua, document)?)?;

    let meta = lua.create_table()?;
    meta.set("__index", lua.globals())?;
    env.set_metatable(Some(meta));
    Ok(env)
}

// ═══════════════════════════════════════════════════════════════════════
// Host API: json
// ═══════════════════════════════════════════════════════════════════════

fn register_json_api(lua: &Lua) -> LuaResult<()> {
    let json_table = lua.create_table()?;

    json_table.set(
        "parse",
        lua.create_function(|lua, s: String| {
            let value: Value = serde_json::from_str(&s)
                .map_err(|e| mlua::Error::external(anyhow!("json.parse: {}", e)))?;
            json_value_to_lua(lua, &value)
        })?,
    )?;

    json_table.set(
        "encode",
        lua.create_function(|_lua, value: LuaValue| {
            let json = lua_value_to_json(value)?;
            serde_json::to_string(&json)
                .map_err(|e| mlua::Error::external(anyhow!("json.encode: {}", e)))
        })?,
    )?;

    lua.globals().set("json", json_table)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// Value Conversions: JSON ↔ Lua
// ═══════════════════════════════════════════════════════════════════════

fn json_value_to_lua(lua: &Lua, value: &Value) -> LuaResult<LuaValue> {
    match value {
        Value::Null => Ok(LuaValue::Nil),
        Value::Bool(b) => Ok(LuaValue::Boolean(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(LuaValue::Integer(i)),
            None => Ok(LuaValue::Number(n.as_f64().unwrap_or(0.0))),
        },
        Value::String(s) => lua.create_string(s).map(LuaValue::String),
        Value::Array(items) => {
            let table = lua.create_table()?;
            for (i, v) in items.iter().enumerate() {
                table.set(i as i64 + 1, json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
        Value::Object(map) => {
            let table = lua.create_table()?;
            for (k, v) in map {
                table.set(k.as_str(), json_value_to_lua(lua, v)?)?;
            }
            Ok(LuaValue::Table(table))
        }
    }
}

fn lua_value_to_json(value: LuaValue) -> LuaResult<Value> {
    lua_value_to_json_at(value, 0)
}

/// Tables nested deeper than [`MAX_DEPTH`] (including self-referencing
/// tables) are rejected.
fn lua_value_to_json_at(value: LuaValue, depth: usize) -> LuaResult<Value> {
    match value {
        LuaValue::Nil => Ok(Value::Null),
        LuaValue::Boolean(b) => Ok(Value::Bool(b)),
        LuaValue::Integer(i) => Ok(Value::Number(i.into())),
        LuaValue::Number(n) => Ok(serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)),
        LuaValue::String(s) => Ok(Value::String(s.to_str()?.to_string())),
        LuaValue::Table(_) if depth >= MAX_DEPTH => Err(mlua::Error::external(anyhow!(
            "table nested deeper than {} levels (cyclic?)",
            MAX_DEPTH
        ))),
        LuaValue::Table(t) => {
            // Sequences become arrays; anything else becomes an object
            let len = t.raw_len();
            if len > 0 {
                let mut items = Vec::with_capacity(len);
                for i in 1..=len {
                    let v: LuaValue = t.raw_get(i)?;
                    items.push(lua_value_to_json_at(v, depth + 1)?);
                }
                Ok(Value::Array(items))
            } else {
                let mut map = serde_json::Map::new();
                for pair in t.pairs::<String, LuaValue>() {
                    let (k, v) = pair?;
                    map.insert(k, lua_value_to_json_at(v, depth + 1)?);
                }
                Ok(Value::Object(map))
            }
        }
        _ => Ok(Value::Null),
    }
}
