//! TOML configuration.
//!
//! One file describes the database, run tunables, HTTP client settings,
//! logging, every mapping, and every synchronization:
//!
//! ```toml
//! [db]
//! path = "./data/sx.sqlite"
//!
//! [mappings.contact]
//! mapping = { name = "user.name", email = "user.email" }
//! cast = { email = ["string"] }
//!
//! [synchronizations.contacts]
//! source = { url = "https://crm.example.com/api/contacts", results_position = "data" }
//! target = { url = "https://api.example.com/people" }
//! mapping = "contact"
//! ```

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use sync_harness_core::catalog::InMemoryCatalog;
use sync_harness_core::fingerprint::fingerprint;
use sync_harness_core::mapping::{Mapping, MappingDefinition};
use sync_harness_core::models::{DeletePolicy, SourceConfig, Synchronization, TargetConfig};
use sync_harness_core::RunSettings;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub runs: RunsConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub mappings: BTreeMap<String, MappingDefinition>,
    #[serde(default)]
    pub synchronizations: BTreeMap<String, SynchronizationConfig>,
    /// Modification time of the file.
    #[serde(skip)]
    pub modified_at: Option<DateTime<Utc>>,
    /// Last change of each synchronization's own configuration, by id.
    /// Synchronizations missing here fall back to `modified_at`.
    #[serde(skip)]
    pub revisions: HashMap<String, DateTime<Utc>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunsConfig {
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: i64,
    #[serde(default = "default_backoff_secs")]
    pub default_backoff_secs: i64,
    #[serde(default = "default_max_follow_up_depth")]
    pub max_follow_up_depth: usize,
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            log_retention_days: default_log_retention_days(),
            default_backoff_secs: default_backoff_secs(),
            max_follow_up_depth: default_max_follow_up_depth(),
        }
    }
}

fn default_log_retention_days() -> i64 {
    30
}
fn default_backoff_secs() -> i64 {
    60
}
fn default_max_follow_up_depth() -> usize {
    8
}

impl RunsConfig {
    pub fn settings(&self) -> RunSettings {
        RunSettings {
            log_retention: chrono::Duration::days(self.log_retention_days),
            default_backoff: chrono::Duration::seconds(self.default_backoff_secs),
            max_follow_up_depth: self.max_follow_up_depth,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_user_agent() -> String {
    format!("sync-harness/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SynchronizationConfig {
    /// Defaults to the table name (slug).
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub source: SourceSection,
    pub target: TargetSection,
    #[serde(default)]
    pub mapping: Option<String>,
    #[serde(default)]
    pub hash_mapping: Option<String>,
    #[serde(default)]
    pub reverse_mapping: Option<String>,
    /// Lua boolean expression.
    #[serde(default)]
    pub conditions: Option<String>,
    #[serde(default)]
    pub follow_ups: Vec<String>,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub delete_policy: DeletePolicy,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SourceSection {
    pub url: String,
    #[serde(default)]
    pub results_position: Option<String>,
    #[serde(default = "default_id_position")]
    pub id_position: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    #[serde(default = "default_page_param")]
    pub page_param: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TargetSection {
    pub url: String,
    #[serde(default = "default_id_position")]
    pub id_position: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default = "default_update_method")]
    pub update_method: String,
}

fn default_id_position() -> String {
    "id".to_string()
}
fn default_page_param() -> String {
    "page".to_string()
}
fn default_update_method() -> String {
    "PUT".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.modified_at = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(DateTime::<Utc>::from);

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.runs.log_retention_days <= 0 {
        bail!("runs.log_retention_days must be > 0");
    }
    if config.runs.default_backoff_secs <= 0 {
        bail!("runs.default_backoff_secs must be > 0");
    }
    if config.http.timeout_secs == 0 {
        bail!("http.timeout_secs must be > 0");
    }

    let mut ids = HashSet::new();
    let mut known = HashSet::new();
    for (slug, sync) in &config.synchronizations {
        let id = sync.id.clone().unwrap_or_else(|| slug.clone());
        if !ids.insert(id.clone()) {
            bail!("duplicate synchronization id '{}'", id);
        }
        known.insert(id);
        known.insert(slug.clone());
    }

    for (slug, sync) in &config.synchronizations {
        if sync.source.url.trim().is_empty() {
            bail!("synchronizations.{}.source.url must not be empty", slug);
        }
        if sync.target.url.trim().is_empty() {
            bail!("synchronizations.{}.target.url must not be empty", slug);
        }
        match sync.target.update_method.to_ascii_uppercase().as_str() {
            "PUT" | "PATCH" | "POST" => {}
            other => bail!(
                "synchronizations.{}.target.update_method: unknown method '{}'. Must be PUT, PATCH, or POST.",
                slug,
                other
            ),
        }
        for mapping in [&sync.mapping, &sync.hash_mapping, &sync.reverse_mapping]
            .into_iter()
            .flatten()
        {
            if !config.mappings.contains_key(mapping) {
                bail!(
                    "synchronizations.{} references unknown mapping '{}'",
                    slug,
                    mapping
                );
            }
        }
        for follow_up in &sync.follow_ups {
            if !known.contains(follow_up) {
                bail!(
                    "synchronizations.{} has unknown follow-up '{}'",
                    slug,
                    follow_up
                );
            }
        }
    }

    Ok(())
}

impl Config {
    /// Resolved synchronization models, with `${VAR}` expanded in header values.
    ///
    /// `updated_at` is the synchronization's revision time when known,
    /// otherwise the file's modification time.
    pub fn synchronizations(&self) -> Result<Vec<Synchronization>> {
        self.synchronizations
            .iter()
            .map(|(slug, sync)| {
                let updated_at = self
                    .revisions
                    .get(&sync.id_or(slug))
                    .copied()
                    .or(self.modified_at)
                    .unwrap_or_default();
                sync.to_model(slug, updated_at)
                    .with_context(|| format!("Invalid synchronization '{}'", slug))
            })
            .collect()
    }

    /// Fingerprint of each synchronization's section plus the mappings it
    /// references, keyed by synchronization id.
    ///
    /// Editing one synchronization (or a mapping only it uses) changes only
    /// its own hash.
    pub fn revision_hashes(&self) -> Result<BTreeMap<String, String>> {
        let mut hashes = BTreeMap::new();
        for (slug, sync) in &self.synchronizations {
            let referenced = [&sync.mapping, &sync.hash_mapping, &sync.reverse_mapping];
            let mappings: Map<String, Value> = referenced
                .into_iter()
                .flatten()
                .filter_map(|name| {
                    let definition = self.mappings.get(name)?;
                    Some(serde_json::to_value(definition).map(|v| (name.clone(), v)))
                })
                .collect::<serde_json::Result<_>>()?;
            let section = json!({
                "slug": slug,
                "synchronization": serde_json::to_value(sync)?,
                "mappings": mappings,
            });
            let hash = fingerprint(&section)
                .with_context(|| format!("Cannot fingerprint synchronization '{}'", slug))?;
            hashes.insert(sync.id_or(slug), hash);
        }
        Ok(hashes)
    }

    /// Compile every mapping and collect every synchronization.
    pub fn catalog(&self) -> Result<InMemoryCatalog> {
        let mut catalog = InMemoryCatalog::new();
        for (name, definition) in &self.mappings {
            let mapping = Mapping::compile(name, definition)
                .with_context(|| format!("Invalid mapping '{}'", name))?;
            catalog.add_mapping(mapping);
        }
        for sync in self.synchronizations()? {
            catalog.add_synchronization(sync);
        }
        Ok(catalog)
    }
}

impl SynchronizationConfig {
    fn id_or(&self, slug: &str) -> String {
        self.id.clone().unwrap_or_else(|| slug.to_string())
    }

    fn to_model(&self, slug: &str, updated_at: DateTime<Utc>) -> Result<Synchronization> {
        let mut source_options = Map::new();
        source_options.insert("headers".into(), expand_headers(&self.source.headers)?);
        source_options.insert("query".into(), string_map(&self.source.query));
        source_options.insert(
            "page_param".into(),
            Value::String(self.source.page_param.clone()),
        );

        let mut target_options = Map::new();
        target_options.insert("headers".into(), expand_headers(&self.target.headers)?);
        target_options.insert(
            "update_method".into(),
            Value::String(self.target.update_method.to_ascii_uppercase()),
        );

        Ok(Synchronization {
            id: self.id_or(slug),
            slug: slug.to_string(),
            name: self.name.clone(),
            source: SourceConfig {
                reference: self.source.url.clone(),
                results_position: self.source.results_position.clone(),
                id_position: self.source.id_position.clone(),
                options: source_options,
            },
            target: TargetConfig {
                reference: self.target.url.clone(),
                id_position: self.target.id_position.clone(),
                options: target_options,
            },
            mapping: self.mapping.clone(),
            hash_mapping: self.hash_mapping.clone(),
            reverse_mapping: self.reverse_mapping.clone(),
            conditions: self.conditions.clone(),
            follow_ups: self.follow_ups.clone(),
            actions: self.actions.clone(),
            delete_policy: self.delete_policy,
            updated_at,
        })
    }
}

fn string_map(values: &BTreeMap<String, String>) -> Value {
    Value::Object(
        values
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

fn expand_headers(headers: &BTreeMap<String, String>) -> Result<Value> {
    let mut out = Map::new();
    for (name, value) in headers {
        let expanded =
            expand_env(value).with_context(|| format!("Failed to expand header '{}'", name))?;
        out.insert(name.clone(), Value::String(expanded));
    }
    Ok(Value::Object(out))
}

/// Replace `${VAR}` references with environment values.
pub fn expand_env(value: &str) -> Result<String> {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            bail!("unterminated '${{' in '{}'", value);
        };
        let name = &after[..end];
        let resolved = std::env::var(name)
            .with_context(|| format!("environment variable '{}' is not set", name))?;
        out.push_str(&resolved);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
