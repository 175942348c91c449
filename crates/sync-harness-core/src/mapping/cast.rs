//! Cast operators applied to mapped values.
//!
//! Casts are parsed once when a mapping is compiled ([`Cast::parse`]) and
//! applied in declaration order to the value at an output path
//! ([`apply_casts`]). A cast on a path that does not exist is skipped.
//!
//! | Cast | Effect |
//! |------|--------|
//! | `string`, `int`, `float`, `bool`, `array` | primitive coercion |
//! | `date` | value is a format pattern rendered for the current time |
//! | `url` / `urlDecode` | form encoding (`+` for space) |
//! | `rawurl` / `rawurlDecode` | RFC 3986 percent encoding |
//! | `html` / `htmlDecode` | HTML entity encoding |
//! | `base64` / `base64Decode` | standard base64 |
//! | `json` / `jsonToArray` | JSON encode / entity-decode then JSON decode |
//! | `utf8` | ASCII transliteration |
//! | `nullStringToNull` | `"null"` becomes `null` |
//! | `coordinateStringToArray` | `"1 2 3 4"` becomes `[[1,2],[3,4]]` |
//! | `keyCantBeValue` | drop the key when its value equals its own path |
//! | `unsetIfValue==X` | drop the key when the value equals `X` (or is empty) |
//! | `setNullIfValue==X` | same trigger, sets `null` instead |
//! | `countValue:path` | replace with the element count at `path` |
//! | `moneyStringToInt` | `"1.234,56"` becomes `123456` |
//! | `intToMoneyString` | `123456` becomes `"1.234,56"` |

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{Datelike, Timelike, Utc};
use serde_json::{Number, Value};

use super::dot;
use crate::error::TransformError;

#[derive(Debug, Clone, PartialEq)]
pub enum Cast {
    String,
    Int,
    Float,
    Bool,
    Array,
    Date,
    Url,
    UrlDecode,
    RawUrl,
    RawUrlDecode,
    Html,
    HtmlDecode,
    Base64,
    Base64Decode,
    Json,
    JsonToArray,
    Utf8,
    NullStringToNull,
    CoordinateStringToArray,
    KeyCantBeValue,
    UnsetIfValue(String),
    SetNullIfValue(String),
    CountValue(String),
    MoneyStringToInt,
    IntToMoneyString,
}

impl Cast {
    /// Parse one cast operator for output path `key`.
    pub fn parse(key: &str, raw: &str) -> Result<Self, TransformError> {
        let raw = raw.trim();
        let invalid = |message: &str| TransformError::InvalidCast {
            key: key.to_string(),
            cast: raw.to_string(),
            message: message.to_string(),
        };

        if let Some(value) = raw.strip_prefix("unsetIfValue==") {
            return Ok(Cast::UnsetIfValue(value.to_string()));
        }
        if let Some(value) = raw.strip_prefix("setNullIfValue==") {
            return Ok(Cast::SetNullIfValue(value.to_string()));
        }
        if let Some(path) = raw.strip_prefix("countValue:") {
            if path.trim().is_empty() {
                return Err(invalid("countValue requires a path"));
            }
            return Ok(Cast::CountValue(path.trim().to_string()));
        }

        Ok(match raw {
            "string" => Cast::String,
            "int" | "integer" => Cast::Int,
            "float" | "double" => Cast::Float,
            "bool" | "boolean" => Cast::Bool,
            "array" => Cast::Array,
            "date" | "datetime" => Cast::Date,
            "url" => Cast::Url,
            "urlDecode" => Cast::UrlDecode,
            "rawurl" => Cast::RawUrl,
            "rawurlDecode" => Cast::RawUrlDecode,
            "html" => Cast::Html,
            "htmlDecode" => Cast::HtmlDecode,
            "base64" => Cast::Base64,
            "base64Decode" => Cast::Base64Decode,
            "json" => Cast::Json,
            "jsonToArray" => Cast::JsonToArray,
            "utf8" => Cast::Utf8,
            "nullStringToNull" => Cast::NullStringToNull,
            "coordinateStringToArray" => Cast::CoordinateStringToArray,
            "keyCantBeValue" => Cast::KeyCantBeValue,
            "moneyStringToInt" => Cast::MoneyStringToInt,
            "intToMoneyString" => Cast::IntToMoneyString,
            "unsetIfValue" | "setNullIfValue" => {
                return Err(invalid("expected '==<value>' after the operator"))
            }
            _ => return Err(invalid("unknown cast operator")),
        })
    }
}

enum Outcome {
    Set(Value),
    Unset,
}

/// Apply `casts` in order to the value at `key` inside `doc`.
pub fn apply_casts(doc: &mut Value, key: &str, casts: &[Cast]) {
    for cast in casts {
        let Some(current) = dot::get(doc, key).cloned() else {
            return;
        };
        match apply(cast, key, current, doc) {
            Outcome::Set(value) => dot::set(doc, key, value),
            Outcome::Unset => {
                dot::remove(doc, key);
            }
        }
    }
}

fn apply(cast: &Cast, key: &str, value: Value, doc: &Value) -> Outcome {
    use Outcome::Set;

    match cast {
        Cast::String => Set(Value::String(to_plain_string(&value))),
        Cast::Int => Set(Value::from(to_int(&value))),
        Cast::Float => Set(float_value(to_float(&value))),
        Cast::Bool => Set(Value::Bool(to_bool(&value))),
        Cast::Array => Set(match value {
            Value::Array(_) | Value::Object(_) => value,
            Value::Null => Value::Array(Vec::new()),
            scalar => Value::Array(vec![scalar]),
        }),
        Cast::Date => Set(Value::String(format_now(&to_plain_string(&value)))),
        Cast::Url => Set(map_str(value, url_encode)),
        Cast::UrlDecode => Set(map_str(value, |s| percent_decode(&s.replace('+', " ")))),
        Cast::RawUrl => Set(map_str(value, |s| urlencoding::encode(s).into_owned())),
        Cast::RawUrlDecode => Set(map_str(value, percent_decode)),
        Cast::Html => Set(map_str(value, html_encode)),
        Cast::HtmlDecode => Set(map_str(value, html_decode)),
        Cast::Base64 => Set(Value::String(STANDARD.encode(to_plain_string(&value)))),
        Cast::Base64Decode => Set(match &value {
            Value::String(s) => match STANDARD.decode(s.trim()) {
                Ok(bytes) => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
                Err(e) => {
                    tracing::debug!(key, error = %e, "base64Decode left value unchanged");
                    value
                }
            },
            _ => value,
        }),
        Cast::Json => Set(Value::String(value.to_string())),
        Cast::JsonToArray => Set(match &value {
            Value::String(s) => serde_json::from_str(&html_decode(s)).unwrap_or(Value::Null),
            _ => value,
        }),
        Cast::Utf8 => Set(map_str(value, transliterate)),
        Cast::NullStringToNull => Set(match value {
            Value::String(s) if s == "null" => Value::Null,
            other => other,
        }),
        Cast::CoordinateStringToArray => Set(match value {
            Value::String(s) => coordinate_string_to_array(&s),
            other => other,
        }),
        Cast::KeyCantBeValue => {
            if to_plain_string(&value) == key {
                Outcome::Unset
            } else {
                Set(value)
            }
        }
        Cast::UnsetIfValue(target) => {
            if matches_value(&value, target) {
                Outcome::Unset
            } else {
                Set(value)
            }
        }
        Cast::SetNullIfValue(target) => {
            if matches_value(&value, target) {
                Set(Value::Null)
            } else {
                Set(value)
            }
        }
        Cast::CountValue(path) => match dot::get(doc, path) {
            Some(Value::Array(items)) => Set(Value::from(items.len())),
            Some(Value::Object(map)) => Set(Value::from(map.len())),
            _ => Set(value),
        },
        Cast::MoneyStringToInt => Set(Value::from(money_string_to_int(&value))),
        Cast::IntToMoneyString => Set(Value::String(int_to_money_string(to_float(&value)))),
    }
}

fn map_str(value: Value, f: impl Fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(&s)),
        Value::Number(_) | Value::Bool(_) => Value::String(f(&to_plain_string(&value))),
        other => other,
    }
}

fn float_value(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

/// String form used when a scalar is coerced to text.
pub(crate) fn to_plain_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(true) => "1".to_string(),
        Value::Bool(false) => String::new(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Leading numeric prefix of a string (`"12abc"` → `"12"`).
fn numeric_prefix(s: &str) -> &str {
    let s = s.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;
    let mut seen_digit = false;
    let mut seen_dot = false;
    let mut seen_exp = false;
    while end < bytes.len() {
        let c = bytes[end];
        match c {
            b'0'..=b'9' => seen_digit = true,
            b'+' | b'-' if end == 0 => {}
            b'+' | b'-' if seen_exp && matches!(bytes[end - 1], b'e' | b'E') => {}
            b'.' if !seen_dot && !seen_exp => seen_dot = true,
            b'e' | b'E' if seen_digit && !seen_exp => seen_exp = true,
            _ => break,
        }
        end += 1;
    }
    let mut prefix = &s[..end];
    while prefix.ends_with(['e', 'E', '+', '-']) {
        prefix = &prefix[..prefix.len() - 1];
    }
    prefix
}

fn to_float(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => numeric_prefix(s).parse().unwrap_or(0.0),
        Value::Array(items) => f64::from(u8::from(!items.is_empty())),
        Value::Object(map) => f64::from(u8::from(!map.is_empty())),
    }
}

fn to_int(value: &Value) -> i64 {
    match value {
        Value::Number(n) => n.as_i64().unwrap_or_else(|| to_float(value).trunc() as i64),
        _ => to_float(value).trunc() as i64,
    }
}

fn to_bool(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "" | "0" | "false" | "no" | "off" | "null"
        ),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Emptiness in the loose sense used by `unsetIfValue` / `setNullIfValue`.
fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty() || s == "0",
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
    }
}

fn all_leaves_empty(value: &Value) -> bool {
    match value {
        Value::Array(items) => items.iter().all(all_leaves_empty),
        Value::Object(map) => map.values().all(all_leaves_empty),
        leaf => is_empty(leaf),
    }
}

fn matches_value(value: &Value, target: &str) -> bool {
    if target.is_empty() {
        return match value {
            Value::Array(_) | Value::Object(_) => all_leaves_empty(value),
            _ => is_empty(value),
        };
    }
    match value {
        Value::String(s) => s == target,
        Value::Number(_) | Value::Bool(_) => to_plain_string(value) == target,
        Value::Null => target == "null",
        _ => false,
    }
}

fn url_encode(s: &str) -> String {
    urlencoding::encode(s)
        .replace("%20", "+")
        .replace('~', "%7E")
}

fn percent_decode(s: &str) -> String {
    let bytes = urlencoding::decode_binary(s.as_bytes());
    String::from_utf8_lossy(&bytes).into_owned()
}

fn html_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#039;"),
            other => out.push(other),
        }
    }
    out
}

fn html_decode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let candidate = &rest[start..];
        let decoded = candidate
            .find(';')
            .filter(|end| *end <= 10)
            .and_then(|end| decode_entity(&candidate[1..end]).map(|c| (c, end)));
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &candidate[end + 1..];
            }
            None => {
                out.push('&');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => {
            let code = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok()?
            } else {
                name.strip_prefix('#')?.parse().ok()?
            };
            char::from_u32(code)
        }
    }
}

fn transliterate(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii() {
            out.push(c);
            continue;
        }
        let replacement = match c {
            'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => "A",
            'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => "a",
            'Æ' => "AE",
            'æ' => "ae",
            'Ç' => "C",
            'ç' => "c",
            'È' | 'É' | 'Ê' | 'Ë' => "E",
            'è' | 'é' | 'ê' | 'ë' => "e",
            'Ì' | 'Í' | 'Î' | 'Ï' => "I",
            'ì' | 'í' | 'î' | 'ï' => "i",
            'Ñ' => "N",
            'ñ' => "n",
            'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' => "O",
            'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' => "o",
            'Ù' | 'Ú' | 'Û' | 'Ü' => "U",
            'ù' | 'ú' | 'û' | 'ü' => "u",
            'Ý' => "Y",
            'ý' | 'ÿ' => "y",
            'ß' => "ss",
            'Œ' => "OE",
            'œ' => "oe",
            'Š' => "S",
            'š' => "s",
            'Ž' => "Z",
            'ž' => "z",
            '€' => "EUR",
            '‘' | '’' => "'",
            '“' | '”' => "\"",
            '–' | '—' => "-",
            '…' => "...",
            '\u{a0}' => " ",
            _ => "?",
        };
        out.push_str(replacement);
    }
    out
}

fn coordinate_token(token: &str) -> Value {
    if let Ok(i) = token.parse::<i64>() {
        return Value::from(i);
    }
    match token.parse::<f64>() {
        Ok(f) if f.is_finite() => float_value(f),
        _ => Value::String(token.to_string()),
    }
}

/// `"lon lat lon lat"` → `[[lon, lat], [lon, lat]]`; a single point is unwrapped.
pub fn coordinate_string_to_array(s: &str) -> Value {
    if s.is_empty() {
        return Value::Array(vec![Value::String(String::new())]);
    }
    let tokens: Vec<Value> = s.split(' ').map(coordinate_token).collect();
    let mut points: Vec<Value> = tokens
        .chunks(2)
        .map(|pair| Value::Array(pair.to_vec()))
        .collect();
    if points.len() == 1 {
        return points.remove(0);
    }
    Value::Array(points)
}

fn money_string_to_int(value: &Value) -> i64 {
    let amount = match value {
        Value::String(s) => {
            let normalized = s.replace('.', "").replace(',', ".");
            numeric_prefix(&normalized).parse::<f64>().unwrap_or(0.0)
        }
        other => to_float(other),
    };
    (amount * 100.0).round() as i64
}

fn int_to_money_string(cents: f64) -> String {
    let amount = cents / 100.0;
    let negative = amount < 0.0;
    let fixed = format!("{:.2}", amount.abs());
    let (whole, fraction) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));

    let mut grouped = String::new();
    for (i, c) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(c);
    }
    format!("{}{},{}", if negative { "-" } else { "" }, grouped, fraction)
}

/// Render `pattern` for the current UTC time using single-letter date format codes (`Y-m-d H:i:s`).
///
/// The value being cast is the pattern, not a date: `"Y-m-d"` becomes today's
/// date. A backslash escapes the next character.
pub fn format_now(pattern: &str) -> String {
    let now = Utc::now();
    let mut out = String::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        let piece = match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
                continue;
            }
            'd' => now.format("%d").to_string(),
            'D' => now.format("%a").to_string(),
            'j' => now.day().to_string(),
            'l' => now.format("%A").to_string(),
            'N' => now.weekday().number_from_monday().to_string(),
            'w' => now.weekday().num_days_from_sunday().to_string(),
            'z' => now.ordinal0().to_string(),
            'W' => now.format("%V").to_string(),
            'F' => now.format("%B").to_string(),
            'm' => now.format("%m").to_string(),
            'M' => now.format("%b").to_string(),
            'n' => now.month().to_string(),
            'Y' => now.year().to_string(),
            'y' => now.format("%y").to_string(),
            'a' => now.format("%P").to_string(),
            'A' => now.format("%p").to_string(),
            'g' => now.format("%-I").to_string(),
            'G' => now.hour().to_string(),
            'h' => now.format("%I").to_string(),
            'H' => now.format("%H").to_string(),
            'i' => now.format("%M").to_string(),
            's' => now.format("%S").to_string(),
            'u' => now.format("%6f").to_string(),
            'v' => now.format("%3f").to_string(),
            'e' | 'T' => "UTC".to_string(),
            'P' => "+00:00".to_string(),
            'O' => "+0000".to_string(),
            'c' => now.format("%Y-%m-%dT%H:%M:%S+00:00").to_string(),
            'r' => now.format("%a, %d %b %Y %H:%M:%S +0000").to_string(),
            'U' => now.timestamp().to_string(),
            other => other.to_string(),
        };
        out.push_str(&piece);
    }
    out
}
