//! SQLite-backed [`ContractStore`] implementation.
//!
//! Contract upserts are compare-and-set on the `version` column: inserts use
//! `ON CONFLICT DO NOTHING` and updates carry `WHERE version = ?`, so a
//! writer that lost a race sees zero affected rows and gets
//! [`StoreError::Conflict`].

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{Sqlite, SqliteRow};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use sync_harness_core::error::StoreError;
use sync_harness_core::models::{
    ContractLog, LogLevel, RunCounts, SyncAction, SynchronizationContract, SynchronizationLog,
};
use sync_harness_core::store::{ContractStore, StoreResult};

/// SQLite implementation of the [`ContractStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Record the configuration hash of each synchronization and return when
    /// each one last changed.
    ///
    /// An unseen synchronization is stamped `first_seen`; a changed hash is
    /// stamped `now`; an unchanged hash keeps its stored time.
    pub async fn stamp_revisions(
        &self,
        hashes: &BTreeMap<String, String>,
        first_seen: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<HashMap<String, DateTime<Utc>>> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        let mut revisions = HashMap::with_capacity(hashes.len());

        for (id, hash) in hashes {
            let stored: Option<(String, i64)> = sqlx::query_as(
                "SELECT config_hash, changed_at FROM synchronization_revisions WHERE synchronization_id = ?",
            )
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(backend)?;

            let changed_at = match stored {
                Some((stored_hash, changed_at)) if &stored_hash == hash => {
                    revisions.insert(id.clone(), from_millis(changed_at)?);
                    continue;
                }
                Some(_) => now,
                None => first_seen,
            };

            sqlx::query(
                r#"
                INSERT INTO synchronization_revisions (synchronization_id, config_hash, changed_at)
                VALUES (?, ?, ?)
                ON CONFLICT(synchronization_id) DO UPDATE SET
                    config_hash = excluded.config_hash,
                    changed_at = excluded.changed_at
                "#,
            )
            .bind(id)
            .bind(hash)
            .bind(millis(changed_at))
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

            tracing::debug!(synchronization = %id, %changed_at, "configuration revision recorded");
            revisions.insert(id.clone(), from_millis(millis(changed_at))?);
        }

        tx.commit().await.map_err(backend)?;
        Ok(revisions)
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn col<'r, T>(row: &'r SqliteRow, name: &str) -> StoreResult<T>
where
    T: sqlx::Decode<'r, Sqlite> + sqlx::Type<Sqlite>,
{
    row.try_get(name).map_err(backend)
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn opt_millis(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(millis)
}

fn from_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Backend(format!("timestamp out of range: {}", ms)))
}

fn from_opt_millis(ms: Option<i64>) -> StoreResult<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

fn parse_uuid(raw: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Backend(format!("bad uuid '{}': {}", raw, e)))
}

fn parse_action(raw: &str) -> StoreResult<SyncAction> {
    raw.parse().map_err(StoreError::Backend)
}

fn contract_from_row(row: &SqliteRow) -> StoreResult<SynchronizationContract> {
    Ok(SynchronizationContract {
        id: parse_uuid(&col::<String>(row, "id")?)?,
        synchronization_id: col(row, "synchronization_id")?,
        origin_id: col(row, "origin_id")?,
        origin_hash: col(row, "origin_hash")?,
        target_id: col(row, "target_id")?,
        target_hash: col(row, "target_hash")?,
        last_action: parse_action(&col::<String>(row, "last_action")?)?,
        source_last_checked: from_opt_millis(col(row, "source_last_checked")?)?,
        source_last_synced: from_opt_millis(col(row, "source_last_synced")?)?,
        target_last_synced: from_opt_millis(col(row, "target_last_synced")?)?,
        version: col(row, "version")?,
        created_at: from_millis(col(row, "created_at")?)?,
        updated_at: from_millis(col(row, "updated_at")?)?,
    })
}

fn log_from_row(row: &SqliteRow) -> StoreResult<SynchronizationLog> {
    let count = |name: &str| col::<i64>(row, name).map(|v| v.max(0) as u64);
    Ok(SynchronizationLog {
        id: parse_uuid(&col::<String>(row, "id")?)?,
        synchronization_id: col(row, "synchronization_id")?,
        started_at: from_millis(col(row, "started_at")?)?,
        finished_at: from_opt_millis(col(row, "finished_at")?)?,
        counts: RunCounts {
            found: count("found")?,
            created: count("created")?,
            updated: count("updated")?,
            skipped: count("skipped")?,
            deleted: count("deleted")?,
            filtered: count("filtered")?,
            errored: count("errored")?,
        },
        level: col::<String>(row, "level")?
            .parse::<LogLevel>()
            .map_err(StoreError::Backend)?,
        message: col(row, "message")?,
        stack_trace: col(row, "stack_trace")?,
        test: col(row, "test")?,
        expires_at: from_opt_millis(col(row, "expires_at")?)?,
    })
}

fn contract_log_from_row(row: &SqliteRow) -> StoreResult<ContractLog> {
    Ok(ContractLog {
        id: parse_uuid(&col::<String>(row, "id")?)?,
        log_id: parse_uuid(&col::<String>(row, "log_id")?)?,
        synchronization_id: col(row, "synchronization_id")?,
        contract_id: col::<Option<String>>(row, "contract_id")?
            .as_deref()
            .map(parse_uuid)
            .transpose()?,
        origin_id: col(row, "origin_id")?,
        action: col::<Option<String>>(row, "action")?
            .as_deref()
            .map(parse_action)
            .transpose()?,
        origin_hash_before: col(row, "origin_hash_before")?,
        origin_hash_after: col(row, "origin_hash_after")?,
        target_hash_before: col(row, "target_hash_before")?,
        target_hash_after: col(row, "target_hash_after")?,
        target_id: col(row, "target_id")?,
        error: col(row, "error")?,
        created_at: from_millis(col(row, "created_at")?)?,
    })
}

#[async_trait]
impl ContractStore for SqliteStore {
    async fn get_contract(
        &self,
        synchronization_id: &str,
        origin_id: &str,
    ) -> StoreResult<Option<SynchronizationContract>> {
        let row = sqlx::query(
            "SELECT * FROM synchronization_contracts WHERE synchronization_id = ? AND origin_id = ?",
        )
        .bind(synchronization_id)
        .bind(origin_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        row.as_ref().map(contract_from_row).transpose()
    }

    async fn upsert_contract(
        &self,
        contract: &SynchronizationContract,
    ) -> StoreResult<SynchronizationContract> {
        let now = Utc::now();
        let result = if contract.version == 0 {
            sqlx::query(
                r#"
                INSERT INTO synchronization_contracts (id, synchronization_id, origin_id,
                    origin_hash, target_id, target_hash, last_action, source_last_checked,
                    source_last_synced, target_last_synced, version, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
                ON CONFLICT(synchronization_id, origin_id) DO NOTHING
                "#,
            )
            .bind(contract.id.to_string())
            .bind(&contract.synchronization_id)
            .bind(&contract.origin_id)
            .bind(&contract.origin_hash)
            .bind(&contract.target_id)
            .bind(&contract.target_hash)
            .bind(contract.last_action.as_str())
            .bind(opt_millis(contract.source_last_checked))
            .bind(opt_millis(contract.source_last_synced))
            .bind(opt_millis(contract.target_last_synced))
            .bind(millis(contract.created_at))
            .bind(millis(now))
            .execute(&self.pool)
            .await
        } else {
            sqlx::query(
                r#"
                UPDATE synchronization_contracts SET
                    origin_hash = ?,
                    target_id = ?,
                    target_hash = ?,
                    last_action = ?,
                    source_last_checked = ?,
                    source_last_synced = ?,
                    target_last_synced = ?,
                    version = version + 1,
                    updated_at = ?
                WHERE synchronization_id = ? AND origin_id = ? AND version = ?
                "#,
            )
            .bind(&contract.origin_hash)
            .bind(&contract.target_id)
            .bind(&contract.target_hash)
            .bind(contract.last_action.as_str())
            .bind(opt_millis(contract.source_last_checked))
            .bind(opt_millis(contract.source_last_synced))
            .bind(opt_millis(contract.target_last_synced))
            .bind(millis(now))
            .bind(&contract.synchronization_id)
            .bind(&contract.origin_id)
            .bind(contract.version)
            .execute(&self.pool)
            .await
        }
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict {
                origin_id: contract.origin_id.clone(),
            });
        }

        let mut stored = contract.clone();
        stored.version += 1;
        stored.updated_at = from_millis(millis(now))?;
        Ok(stored)
    }

    async fn list_stale_contracts(
        &self,
        synchronization_id: &str,
        seen: &HashSet<String>,
    ) -> StoreResult<Vec<SynchronizationContract>> {
        Ok(self
            .list_contracts(synchronization_id)
            .await?
            .into_iter()
            .filter(|c| !seen.contains(&c.origin_id))
            .collect())
    }

    async fn list_contracts(
        &self,
        synchronization_id: &str,
    ) -> StoreResult<Vec<SynchronizationContract>> {
        let rows = sqlx::query(
            "SELECT * FROM synchronization_contracts WHERE synchronization_id = ? ORDER BY origin_id",
        )
        .bind(synchronization_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(contract_from_row).collect()
    }

    async fn delete_contracts(&self, synchronization_id: &str) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        sqlx::query("DELETE FROM synchronization_contract_logs WHERE synchronization_id = ?")
            .bind(synchronization_id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        let result = sqlx::query("DELETE FROM synchronization_contracts WHERE synchronization_id = ?")
            .bind(synchronization_id)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        tx.commit().await.map_err(backend)?;
        Ok(result.rows_affected())
    }

    async fn append_contract_log(&self, entry: &ContractLog) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO synchronization_contract_logs (id, log_id, synchronization_id,
                contract_id, origin_id, action, origin_hash_before, origin_hash_after,
                target_hash_before, target_hash_after, target_id, error, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(entry.log_id.to_string())
        .bind(&entry.synchronization_id)
        .bind(entry.contract_id.map(|id| id.to_string()))
        .bind(&entry.origin_id)
        .bind(entry.action.map(|a| a.as_str()))
        .bind(&entry.origin_hash_before)
        .bind(&entry.origin_hash_after)
        .bind(&entry.target_hash_before)
        .bind(&entry.target_hash_after)
        .bind(&entry.target_id)
        .bind(&entry.error)
        .bind(millis(entry.created_at))
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn list_contract_logs(&self, log_id: Uuid) -> StoreResult<Vec<ContractLog>> {
        let rows = sqlx::query(
            "SELECT * FROM synchronization_contract_logs WHERE log_id = ? ORDER BY created_at, rowid",
        )
        .bind(log_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(contract_log_from_row).collect()
    }

    async fn start_log(&self, log: &SynchronizationLog) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO synchronization_logs (id, synchronization_id, started_at, level,
                message, test)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(log.id.to_string())
        .bind(&log.synchronization_id)
        .bind(millis(log.started_at))
        .bind(log.level.as_str())
        .bind(&log.message)
        .bind(log.test)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn finish_log(&self, log: &SynchronizationLog) -> StoreResult<()> {
        let counts = log.counts;
        let result = sqlx::query(
            r#"
            UPDATE synchronization_logs SET
                finished_at = ?,
                found = ?, created = ?, updated = ?, skipped = ?,
                deleted = ?, filtered = ?, errored = ?,
                level = ?, message = ?, stack_trace = ?, expires_at = ?
            WHERE id = ?
            "#,
        )
        .bind(opt_millis(log.finished_at))
        .bind(counts.found as i64)
        .bind(counts.created as i64)
        .bind(counts.updated as i64)
        .bind(counts.skipped as i64)
        .bind(counts.deleted as i64)
        .bind(counts.filtered as i64)
        .bind(counts.errored as i64)
        .bind(log.level.as_str())
        .bind(&log.message)
        .bind(&log.stack_trace)
        .bind(opt_millis(log.expires_at))
        .bind(log.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Backend(format!(
                "run log {} was never started",
                log.id
            )));
        }
        Ok(())
    }

    async fn list_logs(
        &self,
        synchronization_id: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<SynchronizationLog>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM synchronization_logs
            WHERE (? IS NULL OR synchronization_id = ?)
            ORDER BY started_at DESC
            LIMIT ?
            "#,
        )
        .bind(synchronization_id)
        .bind(synchronization_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        rows.iter().map(log_from_row).collect()
    }

    async fn purge_expired_logs(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        sqlx::query(
            r#"
            DELETE FROM synchronization_contract_logs WHERE log_id IN (
                SELECT id FROM synchronization_logs
                WHERE expires_at IS NOT NULL AND expires_at < ?
            )
            "#,
        )
        .bind(millis(now))
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        let result = sqlx::query(
            "DELETE FROM synchronization_logs WHERE expires_at IS NOT NULL AND expires_at < ?",
        )
        .bind(millis(now))
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)?;
        Ok(result.rows_affected())
    }
}
