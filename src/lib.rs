//! # Sync Harness
//!
//! Contract-based synchronization between JSON/HTTP systems.
//!
//! A synchronization reads paginated objects from a source API, maps them
//! into the target's shape, and creates, updates or deletes them in a target
//! API. A per-object contract ledger in SQLite remembers what was written
//! and the fingerprint it was written from, so unchanged objects are skipped
//! on the next run.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────────┐   ┌─────────────┐
//! │   Source    │──▶│     Orchestrator      │──▶│   Target    │
//! │  HTTP/JSON  │   │ filter→hash→map→write │   │  HTTP/JSON  │
//! └─────────────┘   └──────────┬───────────┘   └─────────────┘
//!                              │
//!                              ▼
//!                     ┌──────────────────┐
//!                     │      SQLite       │
//!                     │ contracts + logs  │
//!                     └──────────────────┘
//! ```
//!
//! The orchestrator, mapping engine and fingerprints live in
//! `sync-harness-core`; this crate provides the native adapters.
//!
//! ## Quick Start
//!
//! ```bash
//! sx init                     # create database
//! sx list                     # show configured synchronizations
//! sx run customers --test     # dry run
//! sx run customers            # synchronize
//! sx logs                     # recent runs
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite contract store |
//! | [`connector_http`] | HTTP source and target connector |
//! | [`lua_eval`] | Lua conditions and templates |
//! | [`run`] | Orchestrator wiring for `sx run` |
//! | [`inspect`] | Listing and maintenance commands |
//! | [`logging`] | Tracing subscriber setup |

pub mod config;
pub mod connector_http;
pub mod db;
pub mod inspect;
pub mod logging;
pub mod lua_eval;
pub mod migrate;
pub mod run;
pub mod sqlite_store;
