//! Read-only and maintenance commands: `sx list`, `sx contracts`,
//! `sx logs`, `sx logs purge` and `sx mapping test`.

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde_json::Value;

use sync_harness_core::catalog::Catalog;
use sync_harness_core::mapping::{transform, Mapping};
use sync_harness_core::store::ContractStore;

use crate::config::Config;
use crate::db;
use crate::lua_eval::LuaEvaluator;
use crate::migrate;
use crate::sqlite_store::SqliteStore;

async fn open_store(config: &Config) -> Result<SqliteStore> {
    let pool = db::connect(config).await?;
    migrate::migrate(&pool).await?;
    Ok(SqliteStore::new(pool))
}

pub fn list_synchronizations(config: &Config) -> Result<()> {
    let synchronizations = config.synchronizations()?;
    if synchronizations.is_empty() {
        println!("No synchronizations configured.");
        return Ok(());
    }

    println!(
        "{:<20} {:<20} {:<8} {:<16} FOLLOW-UPS",
        "ID", "SLUG", "DELETE", "MAPPING"
    );
    for sync in synchronizations {
        println!(
            "{:<20} {:<20} {:<8} {:<16} {}",
            sync.id,
            sync.slug,
            format!("{:?}", sync.delete_policy).to_lowercase(),
            sync.mapping.as_deref().unwrap_or("-"),
            if sync.follow_ups.is_empty() {
                "-".to_string()
            } else {
                sync.follow_ups.join(",")
            }
        );
    }
    Ok(())
}

pub async fn list_contracts(config: &Config, id_or_slug: &str) -> Result<()> {
    let catalog = config.catalog()?;
    let Some(sync) = catalog.synchronization(id_or_slug) else {
        bail!("Unknown synchronization: '{}'", id_or_slug);
    };

    let store = open_store(config).await?;
    let contracts = store.list_contracts(&sync.id).await?;
    if contracts.is_empty() {
        println!("No contracts for {}.", sync.id);
        return Ok(());
    }

    println!(
        "{:<24} {:<24} {:<8} {:<14} LAST SYNCED",
        "ORIGIN", "TARGET", "ACTION", "ORIGIN HASH"
    );
    for contract in contracts {
        println!(
            "{:<24} {:<24} {:<8} {:<14} {}",
            contract.origin_id,
            contract.target_id.as_deref().unwrap_or("-"),
            contract.last_action,
            contract
                .origin_hash
                .as_deref()
                .map(|h| &h[..h.len().min(12)])
                .unwrap_or("-"),
            contract
                .target_last_synced
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    store.pool().close().await;
    Ok(())
}

pub async fn list_logs(config: &Config, synchronization: Option<&str>, limit: usize) -> Result<()> {
    let store = open_store(config).await?;
    let logs = store.list_logs(synchronization, limit).await?;
    if logs.is_empty() {
        println!("No run logs.");
        return Ok(());
    }

    for log in logs {
        let test = if log.test { " test" } else { "" };
        println!(
            "{} {:<7} {}{} [{}] {}",
            log.started_at.to_rfc3339(),
            log.level,
            log.synchronization_id,
            test,
            log.counts,
            log.message
        );
    }
    store.pool().close().await;
    Ok(())
}

pub async fn purge_logs(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let removed = store.purge_expired_logs(Utc::now()).await?;
    println!("purged {} expired run logs", removed);
    store.pool().close().await;
    Ok(())
}

/// Apply a configured mapping to a JSON file and print the output.
///
/// Templates are rendered with the same Lua evaluator a run uses.
pub fn test_mapping(config: &Config, name: &str, input: &Path, list: bool) -> Result<()> {
    let Some(definition) = config.mappings.get(name) else {
        bail!("Unknown mapping: '{}'", name);
    };
    let mapping = Mapping::compile(name, definition)?;

    let raw = std::fs::read_to_string(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let document: Value = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not valid JSON", input.display()))?;

    let output = transform(&mapping, &document, list, &LuaEvaluator::new()?)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
