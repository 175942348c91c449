//! HTTP/JSON source and target connector.
//!
//! Implements both [`SourceConnector`] and [`TargetConnector`] on top of a
//! shared `reqwest::Client` whose timeout comes from `[http] timeout_secs`.
//!
//! # Source
//!
//! `GET` on the synchronization's source URL with its configured headers and
//! query parameters. Cursors map onto the request as follows:
//!
//! | Cursor | Request |
//! |--------|---------|
//! | `Url(u)` | `GET u` (relative URLs resolve against the source URL) |
//! | `Page(n)` | source URL with `<page_param>=n` |
//! | `Token(t)` | source URL with `cursor=t` |
//!
//! `429 Too Many Requests` becomes [`SourceError::RateLimited`], with the
//! reset time read from `X-RateLimit-Reset` (epoch seconds) or
//! `Retry-After` (delta seconds or HTTP date).
//!
//! # Target
//!
//! | Action | Request |
//! |--------|---------|
//! | create | `POST <url>` |
//! | update | `<update_method> <url>/<target id>` |
//! | delete | `DELETE <url>/<target id>` |
//!
//! The target id is read from the response body at the target's
//! `id_position`, falling back to the id the request was made for.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde_json::{Map, Value};

use sync_harness_core::connector::{
    Page, SourceConnector, TargetConnector, WriteAction, WriteOutcome,
};
use sync_harness_core::error::{ConnectorError, SourceError};
use sync_harness_core::mapping::dot;
use sync_harness_core::models::{SourceConfig, TargetConfig};
use sync_harness_core::pagination::Cursor;

use crate::config::HttpConfig;

/// Query parameter carrying an opaque continuation token.
pub const TOKEN_PARAM: &str = "cursor";

#[derive(Clone)]
pub struct HttpConnector {
    client: Client,
}

impl HttpConnector {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    fn request(&self, method: Method, url: Url, options: &Map<String, Value>) -> RequestBuilder {
        let mut request = self
            .client
            .request(method, url)
            .header(reqwest::header::ACCEPT, "application/json");
        for (name, value) in string_entries(options, "headers") {
            request = request.header(name, value);
        }
        request
    }
}

fn transport(err: reqwest::Error) -> ConnectorError {
    ConnectorError::Transport(err.to_string())
}

fn string_entries<'a>(options: &'a Map<String, Value>, key: &str) -> Vec<(&'a str, String)> {
    options
        .get(key)
        .and_then(Value::as_object)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|(k, v)| match v {
                    Value::String(s) => Some((k.as_str(), s.clone())),
                    Value::Number(n) => Some((k.as_str(), n.to_string())),
                    Value::Bool(b) => Some((k.as_str(), b.to_string())),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_url(raw: &str) -> Result<Url, ConnectorError> {
    Url::parse(raw).map_err(|e| ConnectorError::Transport(format!("invalid URL '{}': {}", raw, e)))
}

/// Build the URL for one page of `source`.
pub fn page_url(source: &SourceConfig, cursor: Option<&Cursor>) -> Result<Url, ConnectorError> {
    let base = parse_url(&source.reference)?;

    if let Some(Cursor::Url(next)) = cursor {
        return base
            .join(next)
            .map_err(|e| ConnectorError::Transport(format!("invalid next URL '{}': {}", next, e)));
    }

    let mut url = base;
    {
        let mut pairs = url.query_pairs_mut();
        for (name, value) in string_entries(&source.options, "query") {
            pairs.append_pair(name, &value);
        }
        match cursor {
            Some(Cursor::Page(page)) => {
                let param = source
                    .options
                    .get("page_param")
                    .and_then(Value::as_str)
                    .unwrap_or("page");
                pairs.append_pair(param, &page.to_string());
            }
            Some(Cursor::Token(token)) => {
                pairs.append_pair(TOKEN_PARAM, token);
            }
            _ => {}
        }
    }
    if url.query() == Some("") {
        url.set_query(None);
    }
    Ok(url)
}

/// Reset time announced by a throttling response.
pub fn rate_limit_reset(
    headers: &BTreeMap<String, String>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if let Some(epoch) = headers
        .get("x-ratelimit-reset")
        .and_then(|v| v.trim().parse::<i64>().ok())
    {
        return DateTime::from_timestamp(epoch, 0);
    }

    let retry_after = headers.get("retry-after")?.trim();
    if let Ok(seconds) = retry_after.parse::<i64>() {
        return Some(now + chrono::Duration::seconds(seconds));
    }
    DateTime::parse_from_rfc2822(retry_after)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

fn lowercase_headers(response: &Response) -> BTreeMap<String, String> {
    response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

async fn read_json(response: Response) -> Result<Value, ConnectorError> {
    let text = response.text().await.map_err(transport)?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|e| ConnectorError::Decode(e.to_string()))
}

async fn status_error(response: Response) -> ConnectorError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    ConnectorError::Status { status, body }
}

#[async_trait]
impl SourceConnector for HttpConnector {
    async fn fetch(
        &self,
        source: &SourceConfig,
        cursor: Option<&Cursor>,
    ) -> Result<Page, SourceError> {
        let url = page_url(source, cursor)?;
        tracing::debug!(%url, "fetching source page");

        let response = self
            .request(Method::GET, url, &source.options)
            .send()
            .await
            .map_err(transport)?;
        let headers = lowercase_headers(&response);

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            let reset_at = rate_limit_reset(&headers, Utc::now());
            tracing::warn!(?reset_at, "source answered 429");
            return Err(SourceError::RateLimited { reset_at });
        }
        if !response.status().is_success() {
            return Err(status_error(response).await.into());
        }

        let body = read_json(response).await?;
        Ok(Page { body, headers })
    }
}

#[async_trait]
impl TargetConnector for HttpConnector {
    async fn write(
        &self,
        target: &TargetConfig,
        action: WriteAction,
        payload: &Value,
        existing_target_id: Option<&str>,
    ) -> Result<WriteOutcome, ConnectorError> {
        let object_url = || -> Result<Url, ConnectorError> {
            let id = existing_target_id.filter(|id| !id.is_empty()).ok_or_else(|| {
                ConnectorError::Transport(format!("{:?} requires an existing target id", action))
            })?;
            parse_url(&format!(
                "{}/{}",
                target.reference.trim_end_matches('/'),
                urlencoding::encode(id)
            ))
        };

        let (method, url) = match action {
            WriteAction::Create => (Method::POST, parse_url(&target.reference)?),
            WriteAction::Update => {
                let method = target
                    .options
                    .get("update_method")
                    .and_then(Value::as_str)
                    .unwrap_or("PUT");
                let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                    .map_err(|e| ConnectorError::Transport(e.to_string()))?;
                (method, object_url()?)
            }
            WriteAction::Delete => (Method::DELETE, object_url()?),
        };
        tracing::debug!(%method, %url, "writing target object");

        let mut request = self.request(method, url, &target.options);
        if action != WriteAction::Delete {
            request = request.json(payload);
        }
        let response = request.send().await.map_err(transport)?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }

        let body = read_json(response).await?;
        let target_id = match dot::get(&body, &target.id_position) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => existing_target_id.map(str::to_string),
        };
        let stored = match (action, body) {
            (WriteAction::Delete, _) => Value::Null,
            (_, Value::Null) => payload.clone(),
            (_, body) => body,
        };

        Ok(WriteOutcome { target_id, stored })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source(options: Value) -> SourceConfig {
        SourceConfig {
            reference: "https://api.example.com/v1/items?sort=id".into(),
            results_position: None,
            id_position: "id".into(),
            options: options.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_page_url_variants() {
        let src = source(json!({ "query": { "limit": "50" }, "page_param": "p" }));
        assert_eq!(
            page_url(&src, None).unwrap().as_str(),
            "https://api.example.com/v1/items?sort=id&limit=50"
        );
        assert_eq!(
            page_url(&src, Some(&Cursor::Page(3))).unwrap().as_str(),
            "https://api.example.com/v1/items?sort=id&limit=50&p=3"
        );
        assert_eq!(
            page_url(&src, Some(&Cursor::Token("abc".into()))).unwrap().as_str(),
            "https://api.example.com/v1/items?sort=id&limit=50&cursor=abc"
        );
        assert_eq!(
            page_url(&src, Some(&Cursor::Url("/v1/items?after=9".into())))
                .unwrap()
                .as_str(),
            "https://api.example.com/v1/items?after=9"
        );
    }

    #[test]
    fn test_rate_limit_reset_sources() {
        let now = Utc::now();
        let mut headers = BTreeMap::new();
        assert_eq!(rate_limit_reset(&headers, now), None);

        headers.insert("retry-after".to_string(), "120".to_string());
        assert_eq!(rate_limit_reset(&headers, now), Some(now + chrono::Duration::seconds(120)));

        headers.insert("retry-after".to_string(), "Wed, 21 Oct 2015 07:28:00 GMT".to_string());
        assert_eq!(
            rate_limit_reset(&headers, now).map(|t| t.timestamp()),
            Some(1445412480)
        );

        headers.insert("x-ratelimit-reset".to_string(), "1700000000".to_string());
        assert_eq!(
            rate_limit_reset(&headers, now).map(|t| t.timestamp()),
            Some(1700000000)
        );
    }
}
