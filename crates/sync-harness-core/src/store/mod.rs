//! Storage abstraction for synchronization state.
//!
//! The [`ContractStore`] trait covers everything a run persists: the
//! per-object contract ledger, the per-run log, and the per-contract audit
//! trail. Backends: [`memory::InMemoryStore`] here, SQLite in the app crate.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{ContractLog, SynchronizationContract, SynchronizationLog};

pub type StoreResult<T> = Result<T, StoreError>;

/// Abstract persistence backend for contracts and logs.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`get_contract`](ContractStore::get_contract) | Contract for one (synchronization, origin) pair |
/// | [`upsert_contract`](ContractStore::upsert_contract) | Compare-and-set insert or update |
/// | [`list_stale_contracts`](ContractStore::list_stale_contracts) | Contracts whose origin was not seen in a run |
/// | [`list_contracts`](ContractStore::list_contracts) | All contracts of a synchronization |
/// | [`delete_contracts`](ContractStore::delete_contracts) | Cascade for a removed synchronization |
/// | [`append_contract_log`](ContractStore::append_contract_log) | Audit record for one contract touch |
/// | [`start_log`](ContractStore::start_log) / [`finish_log`](ContractStore::finish_log) | Run log lifecycle |
/// | [`purge_expired_logs`](ContractStore::purge_expired_logs) | Retention |
#[async_trait]
pub trait ContractStore: Send + Sync {
    async fn get_contract(
        &self,
        synchronization_id: &str,
        origin_id: &str,
    ) -> StoreResult<Option<SynchronizationContract>>;

    /// Insert or update a contract, guarded by its `version`.
    ///
    /// `version == 0` inserts and fails with [`StoreError::Conflict`] if a
    /// contract for the same (synchronization, origin) pair already exists.
    /// Otherwise the stored row must still carry the same version. Returns the
    /// stored contract with its version incremented.
    async fn upsert_contract(
        &self,
        contract: &SynchronizationContract,
    ) -> StoreResult<SynchronizationContract>;

    /// Contracts of `synchronization_id` whose origin id is not in `seen`.
    async fn list_stale_contracts(
        &self,
        synchronization_id: &str,
        seen: &HashSet<String>,
    ) -> StoreResult<Vec<SynchronizationContract>>;

    async fn list_contracts(
        &self,
        synchronization_id: &str,
    ) -> StoreResult<Vec<SynchronizationContract>>;

    /// Remove every contract (and contract log) of a synchronization.
    async fn delete_contracts(&self, synchronization_id: &str) -> StoreResult<u64>;

    async fn append_contract_log(&self, entry: &ContractLog) -> StoreResult<()>;

    async fn list_contract_logs(&self, log_id: Uuid) -> StoreResult<Vec<ContractLog>>;

    async fn start_log(&self, log: &SynchronizationLog) -> StoreResult<()>;

    /// Persist the final counts, level, message and expiry of a run log.
    async fn finish_log(&self, log: &SynchronizationLog) -> StoreResult<()>;

    /// Most recent run logs first, optionally for one synchronization.
    async fn list_logs(
        &self,
        synchronization_id: Option<&str>,
        limit: usize,
    ) -> StoreResult<Vec<SynchronizationLog>>;

    /// Delete run logs (and their contract logs) that expired before `now`.
    async fn purge_expired_logs(&self, now: DateTime<Utc>) -> StoreResult<u64>;
}
