//! Core data models for synchronization runs.
//!
//! These types describe the configuration a run reads ([`Synchronization`]),
//! the per-object change-tracking ledger it maintains
//! ([`SynchronizationContract`]), and the audit records it leaves behind
//! ([`SynchronizationLog`], [`ContractLog`]).

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Action decided for one source object during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
    Skip,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Create => "create",
            SyncAction::Update => "update",
            SyncAction::Delete => "delete",
            SyncAction::Skip => "skip",
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(SyncAction::Create),
            "update" => Ok(SyncAction::Update),
            "delete" => Ok(SyncAction::Delete),
            "skip" => Ok(SyncAction::Skip),
            other => Err(format!("unknown sync action: '{}'", other)),
        }
    }
}

/// Outcome level of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INFO" => Ok(LogLevel::Info),
            "WARNING" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: '{}'", other)),
        }
    }
}

/// What happens to contracts whose origin object was not seen in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletePolicy {
    /// Leave stale contracts and their target objects alone.
    #[default]
    Keep,
    /// Delete the target object and mark the contract `delete`.
    Delete,
}

/// Where and how to read source objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Connector reference, e.g. the collection URL for the HTTP connector.
    pub reference: String,
    /// Dot path to the object array inside a page body (`_root` = the body).
    #[serde(default)]
    pub results_position: Option<String>,
    /// Dot path to the origin identifier inside each object.
    #[serde(default = "default_id_position")]
    pub id_position: String,
    /// Connector-specific settings (headers, query parameters, ...).
    #[serde(default)]
    pub options: Map<String, Value>,
}

/// Where and how to write target objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetConfig {
    pub reference: String,
    /// Dot path to the provider-assigned identifier in a write response.
    #[serde(default = "default_id_position")]
    pub id_position: String,
    #[serde(default)]
    pub options: Map<String, Value>,
}

fn default_id_position() -> String {
    "id".to_string()
}

/// Operator-defined configuration of one source → target synchronization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synchronization {
    pub id: String,
    pub slug: String,
    #[serde(default)]
    pub name: Option<String>,
    pub source: SourceConfig,
    pub target: TargetConfig,
    /// Source → target mapping id.
    #[serde(default)]
    pub mapping: Option<String>,
    /// Mapping that reduces an object to the subset used for its fingerprint.
    #[serde(default)]
    pub hash_mapping: Option<String>,
    /// Target → source mapping, kept for conflict resolution tooling.
    #[serde(default)]
    pub reverse_mapping: Option<String>,
    /// Boolean filter expression evaluated per source object.
    #[serde(default)]
    pub conditions: Option<String>,
    #[serde(default)]
    pub follow_ups: Vec<String>,
    /// Names of hooks fired at run trigger points, in order.
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub delete_policy: DeletePolicy,
    pub updated_at: DateTime<Utc>,
}

/// Change-tracking ledger row for one (synchronization, origin object) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynchronizationContract {
    pub id: Uuid,
    pub synchronization_id: String,
    pub origin_id: String,
    pub origin_hash: Option<String>,
    pub target_id: Option<String>,
    pub target_hash: Option<String>,
    pub last_action: SyncAction,
    pub source_last_checked: Option<DateTime<Utc>>,
    pub source_last_synced: Option<DateTime<Utc>>,
    pub target_last_synced: Option<DateTime<Utc>>,
    /// Optimistic-concurrency counter; 0 means "never stored".
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SynchronizationContract {
    /// A fresh, unsaved contract for an origin object seen for the first time.
    pub fn new(synchronization_id: &str, origin_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            synchronization_id: synchronization_id.to_string(),
            origin_id: origin_id.to_string(),
            origin_hash: None,
            target_id: None,
            target_hash: None,
            last_action: SyncAction::Create,
            source_last_checked: None,
            source_last_synced: None,
            target_last_synced: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-run counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub found: u64,
    pub created: u64,
    pub updated: u64,
    pub skipped: u64,
    pub deleted: u64,
    /// Objects excluded by the synchronization's conditions.
    pub filtered: u64,
    pub errored: u64,
}

impl RunCounts {
    pub fn record(&mut self, action: SyncAction) {
        match action {
            SyncAction::Create => self.created += 1,
            SyncAction::Update => self.updated += 1,
            SyncAction::Delete => self.deleted += 1,
            SyncAction::Skip => self.skipped += 1,
        }
    }
}

impl fmt::Display for RunCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "found {}, created {}, updated {}, skipped {}, deleted {}, filtered {}, errored {}",
            self.found,
            self.created,
            self.updated,
            self.skipped,
            self.deleted,
            self.filtered,
            self.errored
        )
    }
}

/// One row per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynchronizationLog {
    pub id: Uuid,
    pub synchronization_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub counts: RunCounts,
    pub level: LogLevel,
    pub message: String,
    /// Error chain of a run-level failure.
    pub stack_trace: Option<String>,
    pub test: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl SynchronizationLog {
    pub fn start(synchronization_id: &str, test: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            synchronization_id: synchronization_id.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            counts: RunCounts::default(),
            level: LogLevel::Info,
            message: "running".to_string(),
            stack_trace: None,
            test,
            expires_at: None,
        }
    }
}

/// Audit record written every time a contract is evaluated in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractLog {
    pub id: Uuid,
    pub log_id: Uuid,
    pub synchronization_id: String,
    pub contract_id: Option<Uuid>,
    pub origin_id: String,
    pub action: Option<SyncAction>,
    pub origin_hash_before: Option<String>,
    pub origin_hash_after: Option<String>,
    pub target_hash_before: Option<String>,
    pub target_hash_after: Option<String>,
    pub target_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ContractLog {
    /// Record the before/after state of a contract touched in run `log_id`.
    pub fn touched(
        log_id: Uuid,
        before: Option<&SynchronizationContract>,
        after: &SynchronizationContract,
        action: SyncAction,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            log_id,
            synchronization_id: after.synchronization_id.clone(),
            contract_id: Some(after.id),
            origin_id: after.origin_id.clone(),
            action: Some(action),
            origin_hash_before: before.and_then(|c| c.origin_hash.clone()),
            origin_hash_after: after.origin_hash.clone(),
            target_hash_before: before.and_then(|c| c.target_hash.clone()),
            target_hash_after: after.target_hash.clone(),
            target_id: after.target_id.clone(),
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Record an object that failed before its contract could be updated.
    pub fn failed(
        log_id: Uuid,
        synchronization_id: &str,
        origin_id: &str,
        contract_id: Option<Uuid>,
        error: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            log_id,
            synchronization_id: synchronization_id.to_string(),
            contract_id,
            origin_id: origin_id.to_string(),
            action: None,
            origin_hash_before: None,
            origin_hash_after: None,
            target_hash_before: None,
            target_hash_after: None,
            target_id: None,
            error: Some(error),
            created_at: Utc::now(),
        }
    }
}

/// Options for a single run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Evaluate and count everything, but write nothing to the target or store.
    pub test: bool,
    /// Rewrite every object even when its fingerprint is unchanged.
    pub force: bool,
}

/// Outcome of a follow-up synchronization triggered by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUpOutcome {
    pub synchronization_id: String,
    pub level: LogLevel,
    pub message: String,
}

/// Structured result handed back to whoever triggered a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub synchronization_id: String,
    pub log_id: Option<Uuid>,
    pub counts: RunCounts,
    pub level: LogLevel,
    pub message: String,
    /// Earliest time the caller should retry after a rate-limit abort.
    pub reschedule_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub follow_ups: Vec<FollowUpOutcome>,
    #[serde(default)]
    pub test: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_round_trips_through_str() {
        for action in [
            SyncAction::Create,
            SyncAction::Update,
            SyncAction::Delete,
            SyncAction::Skip,
        ] {
            assert_eq!(action.as_str().parse::<SyncAction>().unwrap(), action);
        }
        assert!("upsert".parse::<SyncAction>().is_err());
    }

    #[test]
    fn test_counts_record() {
        let mut counts = RunCounts::default();
        counts.record(SyncAction::Create);
        counts.record(SyncAction::Skip);
        counts.record(SyncAction::Skip);
        assert_eq!(counts.created, 1);
        assert_eq!(counts.skipped, 2);
        assert_eq!(counts.updated, 0);
    }

    #[test]
    fn test_level_serializes_uppercase() {
        let json = serde_json::to_string(&LogLevel::Warning).unwrap();
        assert_eq!(json, "\"WARNING\"");
        assert!(LogLevel::Error > LogLevel::Warning);
    }

    #[test]
    fn test_source_config_defaults() {
        let cfg: SourceConfig =
            serde_json::from_value(serde_json::json!({ "reference": "http://x" })).unwrap();
        assert_eq!(cfg.id_position, "id");
        assert!(cfg.results_position.is_none());
        assert!(cfg.options.is_empty());
    }
}
