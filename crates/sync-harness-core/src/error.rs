//! Error taxonomy for synchronization runs.
//!
//! Run-level propagation rules:
//!
//! | Error | Scope | Effect |
//! |-------|-------|--------|
//! | [`SyncError::NotFound`] | run | escapes [`crate::sync::Orchestrator::run`] |
//! | [`SyncError::RateLimited`] | page fetch | run ends `WARNING` with a reschedule hint |
//! | [`SyncError::Connector`] | page fetch | run ends `ERROR` |
//! | [`SyncError::ObjectProcessing`] | one object | counted, logged, run continues |
//!
//! Transform, condition, fingerprint, store and target-write failures raised
//! while handling a single object are wrapped in
//! [`SyncError::ObjectProcessing`].

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failure while applying a mapping recipe.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransformError {
    /// A cast operator name is unknown or its parameter is malformed.
    #[error("invalid cast '{cast}' for '{key}': {message}")]
    InvalidCast {
        key: String,
        cast: String,
        message: String,
    },

    /// A template expression could not be rendered.
    #[error("template for '{key}' failed: {message}")]
    Template { key: String, message: String },

    /// List mode was requested but the input is not a collection.
    #[error("list mapping requires an array or object input, got {found}")]
    NotAList { found: String },
}

/// Failure while canonicalizing a document for hashing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FingerprintError {
    /// The value is not a map and therefore cannot be key-sorted.
    #[error("value is not sortable: expected an object, got {found}")]
    NotSortable { found: String },

    /// Nesting exceeds the canonicalization depth limit.
    #[error("document nesting exceeds {limit} levels")]
    TooDeep { limit: usize },
}

/// Transport-level failure reported by a source or target connector.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConnectorError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode response: {0}")]
    Decode(String),
}

/// Result of a source page fetch that did not produce a page.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SourceError {
    /// The source asked us to back off, optionally saying until when.
    #[error("source is rate limited")]
    RateLimited { reset_at: Option<DateTime<Utc>> },

    #[error(transparent)]
    Connector(#[from] ConnectorError),
}

/// Contract store failure.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    /// The stored contract version no longer matches the one the caller read.
    #[error("contract for origin '{origin_id}' was modified concurrently")]
    Conflict { origin_id: String },

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Errors raised by a synchronization run.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("source rate limited")]
    RateLimited { reset_at: Option<DateTime<Utc>> },

    #[error("transform error: {0}")]
    Transform(#[from] TransformError),

    #[error("connector error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("fingerprint error: {0}")]
    Fingerprint(#[from] FingerprintError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The condition evaluator rejected the expression or failed on the object.
    #[error("condition failed: {0}")]
    Condition(String),

    /// A source object has no usable identifier at the configured position.
    #[error("no origin id at '{position}'")]
    MissingOriginId { position: String },

    #[error("object '{origin_id}' failed: {source}")]
    ObjectProcessing {
        origin_id: String,
        #[source]
        source: Box<SyncError>,
    },
}

impl SyncError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Scope an error to one source object.
    pub fn for_object(origin_id: impl Into<String>, source: SyncError) -> Self {
        Self::ObjectProcessing {
            origin_id: origin_id.into(),
            source: Box::new(source),
        }
    }
}

impl From<SourceError> for SyncError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::RateLimited { reset_at } => Self::RateLimited { reset_at },
            SourceError::Connector(e) => Self::Connector(e),
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
