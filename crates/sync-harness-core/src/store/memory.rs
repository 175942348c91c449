//! In-memory [`ContractStore`] implementation for tests and embedding.
//!
//! Uses `HashMap` and `Vec` behind `std::sync::RwLock`. The compare-and-set
//! in [`upsert_contract`](ContractStore::upsert_contract) happens under a
//! single write lock, so it is atomic per key.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{ContractLog, SynchronizationContract, SynchronizationLog};

use super::{ContractStore, StoreResult};

type ContractKey = (String, String);

/// In-memory store for tests.
#[derive(Default)]
pub struct InMemoryStore {
    contracts: RwLock<HashMap<ContractKey, SynchronizationContract>>,
    contract_logs: RwLock<Vec<ContractLog>>,
    logs: RwLock<Vec<SynchronizationLog>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn read<T>(lock: &RwLock<T>) -> StoreResult<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| StoreError::Backend("in-memory store lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> StoreResult<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| StoreError::Backend("in-memory store lock poisoned".to_string()))
}

#[async_trait]
impl ContractStore for InMemoryStore {
    async fn get_contract(
        &self,
        synchronization_id: &str,
        origin_id: &str,
    ) -> StoreResult<Option<SynchronizationContract>> {
        let key = (synchronization_id.to_string(), origin_id.to_string());
        Ok(read(&self.contracts)?.get(&key).cloned())
    }

    async fn upsert_contract(
        &self,
        contract: &SynchronizationContract,
    ) -> StoreResult<SynchronizationContract> {
        let key = (
            contract.synchronization_id.clone(),
            contract.origin_id.clone(),
        );
        let mut contracts = write(&self.contracts)?;
        let current_version = contracts.get(&key).map(|c| c.version).unwrap_or(0);
        if current_version != contract.version {
            return Err(StoreError::Conflict {
                origin_id: contract.origin_id.clone(),
            });
        }

        let mut stored = contract.clone();
        stored.version += 1;
        stored.updated_at = Utc::now();
        contracts.insert(key, stored.clone());
        Ok(stored)
    }

    async fn list_stale_contracts(
        &self,
        synchronization_id: &str,
        seen: &HashSet<String>,
    ) -> StoreResult<Vec<SynchronizationContract>> {
        let mut stale: Vec<_> = read(&self.contracts)?
            .values()
            .filter(|c| c.synchronization_id == synchronization_id && !seen.contains(&c.origin_id))
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.origin_id.cmp(&b.origin_id));
        Ok(stale)
    }

    async fn list_contracts(
        &self,
        synchronization_id: &str,
    ) -> StoreResult<Vec<SynchronizationContract>> {
        let mut contracts: Vec<_> = read(&self.contracts)?
            .values()
            .filter(|c| c.synchronization_id == synchronization_id)
            .cloned()
            .collect();
        contracts.sort_by(|a, b| a.origin_id.cmp(&b.origin_id));
        Ok(contracts)
    }

    async fn delete_contracts(&self, synchronization_id: &str) -> StoreResult<u64> {
        let mut contracts = write(&self.contracts)?;
        let before = contracts.len();
        contracts.retain(|(sync_id, _), _| sync_id != synchronization_id);
        let removed = (before - contracts.len()) as u64;
        drop(contracts);

        write(&self.contract_logs)?.retain(|l| l.synchronization_id != synchronization_id);
        Ok(removed)
    }

    async fn append_contract_log(&self, entry: &ContractLog) -> StoreResult<()> {
        write(&self.contract_logs)?.push(entry.clone());
        Ok(())
    }

    async fn list_contract_logs(&self, log_id: Uuid) -> StoreResult<Vec<ContractLog>> {
        Ok(read(&self.contract_logs)?
            .iter()
            .filter(|l| l.log_id == log_id)
            .cloned()
            .collect())
    }

    async fn start_log(&self, log: &SynchronizationLog) -> StoreResult<()> {
        write(&self.logs)?.push(log.clone());
        Ok(())
    }

    async fn finish_log(&self, log: &SynchronizationLog) -> StoreResult<()> {
        let mut logs = write(&self.logs)?;
        match logs.iter_mut().find(|l| l.id == log.id) {
            Some(existing) => {
                *existing = log.clone();
                Ok(())
            }
            None => Err(StoreError::Backend(format!("run log {} was never started", log.id))),
        }
    }

    async fn list_logs(
        &self,
        synchronization_id: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<SynchronizationLog>> {
        let mut logs: Vec<_> = read(&self.logs)?
            .iter()
            .filter(|l| synchronization_id.map_or(true, |id| l.synchronization_id == id))
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        logs.truncate(limit);
        Ok(logs)
    }

    async fn purge_expired_logs(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut logs = write(&self.logs)?;
        let expired: HashSet<Uuid> = logs
            .iter()
            .filter(|l| l.expires_at.is_some_and(|at| at < now))
            .map(|l| l.id)
            .collect();
        logs.retain(|l| !expired.contains(&l.id));
        drop(logs);

        write(&self.contract_logs)?.retain(|l| !expired.contains(&l.log_id));
        Ok(expired.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_insert_then_conflicting_insert() {
        let store = InMemoryStore::new();
        let contract = SynchronizationContract::new("s", "1");
        let stored = store.upsert_contract(&contract).await.unwrap();
        assert_eq!(stored.version, 1);

        let err = store.upsert_contract(&contract).await.unwrap_err();
        assert_eq!(err, StoreError::Conflict { origin_id: "1".into() });
    }

    #[tokio::test]
    async fn test_update_requires_current_version() {
        let store = InMemoryStore::new();
        let stored = store
            .upsert_contract(&SynchronizationContract::new("s", "1"))
            .await
            .unwrap();

        let mut first = stored.clone();
        first.origin_hash = Some("a".into());
        let updated = store.upsert_contract(&first).await.unwrap();
        assert_eq!(updated.version, 2);

        let mut stale = stored;
        stale.origin_hash = Some("b".into());
        assert!(store.upsert_contract(&stale).await.is_err());

        let current = store.get_contract("s", "1").await.unwrap().unwrap();
        assert_eq!(current.origin_hash.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_stale_listing_excludes_seen_and_other_syncs() {
        let store = InMemoryStore::new();
        for (sync, origin) in [("s", "1"), ("s", "2"), ("other", "3")] {
            store
                .upsert_contract(&SynchronizationContract::new(sync, origin))
                .await
                .unwrap();
        }
        let seen: HashSet<String> = ["1".to_string()].into_iter().collect();
        let stale = store.list_stale_contracts("s", &seen).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].origin_id, "2");
    }

    #[tokio::test]
    async fn test_purge_expired_logs() {
        let store = InMemoryStore::new();
        let mut old = SynchronizationLog::start("s", false);
        old.expires_at = Some(Utc::now() - Duration::days(1));
        let mut fresh = SynchronizationLog::start("s", false);
        fresh.expires_at = Some(Utc::now() + Duration::days(1));
        store.start_log(&old).await.unwrap();
        store.start_log(&fresh).await.unwrap();
        store
            .append_contract_log(&ContractLog::failed(old.id, "s", "1", None, "x".into()))
            .await
            .unwrap();

        assert_eq!(store.purge_expired_logs(Utc::now()).await.unwrap(), 1);
        let logs = store.list_logs(Some("s"), 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].id, fresh.id);
        assert!(store.list_contract_logs(old.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finish_unknown_log_fails() {
        let store = InMemoryStore::new();
        let log = SynchronizationLog::start("s", false);
        assert!(store.finish_log(&log).await.is_err());
    }
}
