//! Run wiring for the `sx run` command.
//!
//! Builds an [`Orchestrator`] from configuration with the native adapters
//! (SQLite contract store, HTTP connector, Lua evaluator, tracing hook),
//! executes one synchronization and prints the outcome.
//!
//! Output goes to stdout: a short human summary by default, or the full
//! `RunResult` as JSON with `--json`. Tracing output goes to stderr.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use sync_harness_core::hooks::{ActionHook, HookEvent, HookRegistry};
use sync_harness_core::models::{LogLevel, RunOptions, RunResult, Synchronization};
use sync_harness_core::Orchestrator;

use crate::config::Config;
use crate::connector_http::HttpConnector;
use crate::db;
use crate::lua_eval::LuaEvaluator;
use crate::migrate;
use crate::sqlite_store::SqliteStore;

/// Action name under which [`LogHook`] is registered.
pub const LOG_ACTION: &str = "log";

/// Action hook that reports run events through `tracing`.
pub struct LogHook;

#[async_trait]
impl ActionHook for LogHook {
    async fn on_event(&self, synchronization: &Synchronization, event: &HookEvent) -> Result<()> {
        match event {
            HookEvent::RunStarted { test, .. } => {
                tracing::info!(synchronization = %synchronization.id, test, "run started");
            }
            HookEvent::ObjectSynchronized {
                origin_id,
                target_id,
                action,
                ..
            } => {
                tracing::info!(
                    synchronization = %synchronization.id,
                    origin_id = %origin_id,
                    target_id = target_id.as_deref().unwrap_or("-"),
                    action = %action,
                    "object synchronized"
                );
            }
            HookEvent::RunFinished { result } => {
                tracing::info!(
                    synchronization = %synchronization.id,
                    level = %result.level,
                    counts = %result.counts,
                    "run finished"
                );
            }
        }
        Ok(())
    }
}

/// Assemble an orchestrator over `pool` from `config`.
pub fn build_orchestrator(config: &Config, pool: SqlitePool) -> Result<Orchestrator> {
    let catalog = Arc::new(config.catalog()?);
    let store = Arc::new(SqliteStore::new(pool));
    let http = Arc::new(HttpConnector::new(&config.http)?);
    let lua = Arc::new(LuaEvaluator::new()?);

    let mut hooks = HookRegistry::new();
    hooks.register(LOG_ACTION, Arc::new(LogHook));

    Ok(Orchestrator::new(catalog, store, http.clone(), http)
        .with_conditions(lua.clone())
        .with_templates(lua)
        .with_hooks(hooks)
        .with_settings(config.runs.settings()))
}

/// Stamp each synchronization's configuration revision into `config`.
///
/// Contracts written before a synchronization's last revision are rewritten
/// on the next run; editing one synchronization leaves the others alone.
pub async fn load_revisions(config: &mut Config, pool: &SqlitePool) -> Result<()> {
    let now = Utc::now();
    let first_seen = config.modified_at.unwrap_or(now);
    config.revisions = SqliteStore::new(pool.clone())
        .stamp_revisions(&config.revision_hashes()?, first_seen, now)
        .await
        .context("Failed to record configuration revisions")?;
    Ok(())
}

/// Run one synchronization (and its follow-ups) and print the result.
///
/// Ctrl-C cancels the run between objects; contracts already written are
/// kept. Returns the result so the caller can pick the exit status.
pub async fn run_synchronization(
    config: &Config,
    id_or_slug: &str,
    options: RunOptions,
    json: bool,
) -> Result<RunResult> {
    let pool = db::connect(config).await?;
    migrate::migrate(&pool).await?;

    let mut config = config.clone();
    load_revisions(&mut config, &pool).await?;
    let orchestrator = build_orchestrator(&config, pool.clone())?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    let result = orchestrator
        .run(id_or_slug, options, &cancel)
        .await
        .with_context(|| format!("Cannot run '{}'", id_or_slug))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_summary(&result);
    }

    pool.close().await;
    Ok(result)
}

/// Print a human-readable run summary.
pub fn print_summary(result: &RunResult) {
    let suffix = if result.test { " (test)" } else { "" };
    println!("run {}{}", result.synchronization_id, suffix);
    println!("  found:    {}", result.counts.found);
    println!("  created:  {}", result.counts.created);
    println!("  updated:  {}", result.counts.updated);
    println!("  skipped:  {}", result.counts.skipped);
    println!("  deleted:  {}", result.counts.deleted);
    println!("  filtered: {}", result.counts.filtered);
    println!("  errored:  {}", result.counts.errored);
    if let Some(at) = result.reschedule_at {
        println!("  reschedule at: {}", at.to_rfc3339());
    }
    for follow_up in &result.follow_ups {
        println!(
            "  follow-up {}: {} {}",
            follow_up.synchronization_id, follow_up.level, follow_up.message
        );
    }
    println!("{}: {}", level_word(result.level), result.message);
}

fn level_word(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Info => "ok",
        LogLevel::Warning => "warning",
        LogLevel::Error => "error",
    }
}
