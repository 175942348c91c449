//! Schema migrations.
//!
//! Every statement is idempotent (`IF NOT EXISTS`), so `sx init` and every
//! command that opens the store can run them unconditionally.
//!
//! Timestamps are stored as INTEGER milliseconds since the Unix epoch.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    // One row per (synchronization, origin object)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS synchronization_contracts (
            id TEXT PRIMARY KEY,
            synchronization_id TEXT NOT NULL,
            origin_id TEXT NOT NULL,
            origin_hash TEXT,
            target_id TEXT,
            target_hash TEXT,
            last_action TEXT NOT NULL,
            source_last_checked INTEGER,
            source_last_synced INTEGER,
            target_last_synced INTEGER,
            version INTEGER NOT NULL DEFAULT 1,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(synchronization_id, origin_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS synchronization_logs (
            id TEXT PRIMARY KEY,
            synchronization_id TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER,
            found INTEGER NOT NULL DEFAULT 0,
            created INTEGER NOT NULL DEFAULT 0,
            updated INTEGER NOT NULL DEFAULT 0,
            skipped INTEGER NOT NULL DEFAULT 0,
            deleted INTEGER NOT NULL DEFAULT 0,
            filtered INTEGER NOT NULL DEFAULT 0,
            errored INTEGER NOT NULL DEFAULT 0,
            level TEXT NOT NULL,
            message TEXT NOT NULL DEFAULT '',
            stack_trace TEXT,
            test INTEGER NOT NULL DEFAULT 0,
            expires_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS synchronization_contract_logs (
            id TEXT PRIMARY KEY,
            log_id TEXT NOT NULL,
            synchronization_id TEXT NOT NULL,
            contract_id TEXT,
            origin_id TEXT NOT NULL,
            action TEXT,
            origin_hash_before TEXT,
            origin_hash_after TEXT,
            target_hash_before TEXT,
            target_hash_after TEXT,
            target_id TEXT,
            error TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Last configuration change per synchronization
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS synchronization_revisions (
            synchronization_id TEXT PRIMARY KEY,
            config_hash TEXT NOT NULL,
            changed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_logs_sync_started ON synchronization_logs(synchronization_id, started_at)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_contract_logs_log ON synchronization_contract_logs(log_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_contract_logs_sync ON synchronization_contract_logs(synchronization_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
