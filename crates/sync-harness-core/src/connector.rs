//! Transport collaborator traits.
//!
//! The orchestrator never talks to a remote system directly. It asks a
//! [`SourceConnector`] for one page at a time and hands payloads to a
//! [`TargetConnector`]. Implementations own transport concerns: timeouts,
//! authentication, wire formats, and recognising throttling responses.
//!
//! ```text
//!   Orchestrator
//!     │  fetch(source, cursor) ──▶ SourceConnector ──▶ Page { body, headers }
//!     │                                           └──▶ SourceError::RateLimited
//!     │  write(target, action, payload, id) ──▶ TargetConnector ──▶ WriteOutcome
//! ```

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ConnectorError, SourceError};
use crate::models::{SourceConfig, TargetConfig};
use crate::pagination::Cursor;

// ═══════════════════════════════════════════════════════════════════════
// Source
// ═══════════════════════════════════════════════════════════════════════

/// One fetched page: the decoded body and the raw response headers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub body: Value,
    /// Header names lower-cased.
    pub headers: BTreeMap<String, String>,
}

impl Page {
    pub fn new(body: Value) -> Self {
        Self {
            body,
            headers: BTreeMap::new(),
        }
    }
}

/// Reads paginated collections from a source system.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Fetch the page at `cursor`, or the first page when `cursor` is `None`.
    ///
    /// Throttling must be reported as [`SourceError::RateLimited`] rather than
    /// retried internally; the run is rescheduled by its caller instead.
    async fn fetch(&self, source: &SourceConfig, cursor: Option<&Cursor>)
        -> Result<Page, SourceError>;
}

// ═══════════════════════════════════════════════════════════════════════
// Target
// ═══════════════════════════════════════════════════════════════════════

/// Write operation requested from a target connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAction {
    Create,
    Update,
    Delete,
}

/// What the target reported back after a write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    /// Identifier the target assigned (or kept) for the object.
    pub target_id: Option<String>,
    /// Representation the target stored, used for the target fingerprint.
    pub stored: Value,
}

/// Writes objects to a target system.
#[async_trait]
pub trait TargetConnector: Send + Sync {
    /// Create, update, or delete one object.
    ///
    /// `existing_target_id` is set for updates and deletes.
    async fn write(
        &self,
        target: &TargetConfig,
        action: WriteAction,
        payload: &Value,
        existing_target_id: Option<&str>,
    ) -> Result<WriteOutcome, ConnectorError>;
}
