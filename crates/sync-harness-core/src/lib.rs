//! # Sync Harness Core
//!
//! Transport-agnostic logic for Sync Harness: the synchronization data
//! model, the mapping (transform) engine, content fingerprints, pagination
//! heuristics, collaborator traits, and the run orchestrator.
//!
//! This crate contains no sqlx, HTTP client, scripting runtime, or
//! filesystem I/O. The app crate plugs those in through the traits in
//! [`connector`], [`store`], [`catalog`], [`evaluator`] and [`hooks`].

pub mod catalog;
pub mod connector;
pub mod error;
pub mod evaluator;
pub mod fingerprint;
pub mod hooks;
pub mod mapping;
pub mod models;
pub mod pagination;
pub mod store;
pub mod sync;

pub use error::{SyncError, SyncResult};
pub use sync::{Orchestrator, RunSettings};
