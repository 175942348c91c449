//! Results extraction and next-page detection for paginated source bodies.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::mapping::dot;

/// Results position meaning "the response body itself".
pub const ROOT_POSITION: &str = "_root";

const DEFAULT_RESULT_KEYS: [&str; 4] = ["items", "results", "result", "data"];

/// Position in a paginated source collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Cursor {
    /// Absolute or relative URL of the next page.
    Url(String),
    /// 1-based page number.
    Page(u64),
    /// Opaque continuation token.
    Token(String),
}

/// Pull the array of objects out of a page body.
///
/// An unset position falls back to the first array among the common
/// envelope keys, then to the body itself when it is an array.
pub fn extract_results(body: &Value, position: Option<&str>) -> Vec<Value> {
    let found = match position.map(str::trim).filter(|p| !p.is_empty()) {
        Some(ROOT_POSITION) => Some(body),
        Some(path) => dot::get(body, path),
        None => DEFAULT_RESULT_KEYS
            .iter()
            .filter_map(|key| body.get(*key))
            .find(|v| v.is_array())
            .or_else(|| body.is_array().then_some(body)),
    };

    match found {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Object(map)) => map.values().cloned().collect(),
        _ => Vec::new(),
    }
}

/// Find the next-page indicator in a page body.
pub fn next_cursor(body: &Value) -> Option<Cursor> {
    if let Some(next) = body.get("next") {
        match next {
            Value::String(s) if looks_like_url(s) => return Some(Cursor::Url(s.clone())),
            Value::String(s) if !s.is_empty() => return Some(Cursor::Token(s.clone())),
            Value::Number(n) => return n.as_u64().map(Cursor::Page),
            _ => {}
        }
    }

    if let Some(Value::String(href)) = dot::get(body, "_links.next.href") {
        if !href.is_empty() {
            return Some(Cursor::Url(href.clone()));
        }
    }

    if let Some(Value::String(href)) = dot::get(body, "links.next") {
        if !href.is_empty() {
            return Some(Cursor::Url(href.clone()));
        }
    }

    let page = body.get("page").and_then(as_u64);
    let pages = body.get("pages").and_then(as_u64);
    match (page, pages) {
        (Some(page), Some(pages)) if page < pages => Some(Cursor::Page(page + 1)),
        _ => None,
    }
}

fn looks_like_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://") || s.starts_with('/') || s.contains('?')
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_explicit_path() {
        let body = json!({ "data": { "items": [ { "id": 1 }, { "id": 2 } ] } });
        assert_eq!(extract_results(&body, Some("data.items")).len(), 2);
        assert!(extract_results(&body, Some("data.missing")).is_empty());
    }

    #[test]
    fn test_extract_root_and_defaults() {
        let body = json!([ { "id": 1 } ]);
        assert_eq!(extract_results(&body, Some("_root")).len(), 1);
        assert_eq!(extract_results(&body, None).len(), 1);

        let body = json!({ "count": 2, "results": [ 1, 2 ] });
        assert_eq!(extract_results(&body, None), vec![json!(1), json!(2)]);

        let body = json!({ "data": "nope", "items": [ 3 ] });
        assert_eq!(extract_results(&body, None), vec![json!(3)]);

        assert!(extract_results(&json!({ "x": 1 }), None).is_empty());
    }

    #[test]
    fn test_extract_keyed_collection() {
        let body = json!({ "objects": { "a": { "id": "a" }, "b": { "id": "b" } } });
        let items = extract_results(&body, Some("objects"));
        assert_eq!(items, vec![json!({ "id": "a" }), json!({ "id": "b" })]);
    }

    #[test]
    fn test_next_variants() {
        assert_eq!(
            next_cursor(&json!({ "next": "https://api/x?page=2" })),
            Some(Cursor::Url("https://api/x?page=2".into()))
        );
        assert_eq!(
            next_cursor(&json!({ "next": "abc123" })),
            Some(Cursor::Token("abc123".into()))
        );
        assert_eq!(next_cursor(&json!({ "next": 3 })), Some(Cursor::Page(3)));
        assert_eq!(
            next_cursor(&json!({ "_links": { "next": { "href": "/x?p=2" } } })),
            Some(Cursor::Url("/x?p=2".into()))
        );
        assert_eq!(
            next_cursor(&json!({ "links": { "next": "/x?p=2" } })),
            Some(Cursor::Url("/x?p=2".into()))
        );
        assert_eq!(next_cursor(&json!({ "page": 1, "pages": 3 })), Some(Cursor::Page(2)));
    }

    #[test]
    fn test_no_next() {
        assert_eq!(next_cursor(&json!({ "next": null, "results": [] })), None);
        assert_eq!(next_cursor(&json!({ "next": "" })), None);
        assert_eq!(next_cursor(&json!({ "page": "3", "pages": 3 })), None);
        assert_eq!(next_cursor(&json!([1, 2])), None);
    }
}
