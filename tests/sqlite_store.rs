//! Contract store behaviour against a real SQLite database.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use tempfile::TempDir;

use sync_harness::db;
use sync_harness::migrate;
use sync_harness::sqlite_store::SqliteStore;
use sync_harness_core::error::StoreError;
use sync_harness_core::models::{
    ContractLog, LogLevel, SyncAction, SynchronizationContract, SynchronizationLog,
};
use sync_harness_core::store::ContractStore;

async fn store() -> (SqliteStore, TempDir) {
    let dir = TempDir::new().unwrap();
    let pool = db::connect_path(&dir.path().join("data/sx.sqlite"))
        .await
        .unwrap();
    migrate::migrate(&pool).await.unwrap();
    // Migrations are idempotent
    migrate::migrate(&pool).await.unwrap();
    (SqliteStore::new(pool), dir)
}

#[tokio::test]
async fn test_contract_insert_update_and_conflicts() {
    let (store, _dir) = store().await;

    let mut fresh = SynchronizationContract::new("people", "1");
    fresh.origin_hash = Some("h1".into());
    fresh.target_id = Some("t-1".into());
    fresh.source_last_checked = Some(Utc::now());
    let stored = store.upsert_contract(&fresh).await.unwrap();
    assert_eq!(stored.version, 1);

    // A second insert of the same origin loses
    let err = store.upsert_contract(&fresh).await.unwrap_err();
    assert_eq!(err, StoreError::Conflict { origin_id: "1".into() });

    let loaded = store.get_contract("people", "1").await.unwrap().unwrap();
    assert_eq!(loaded.id, fresh.id);
    assert_eq!(loaded.origin_hash.as_deref(), Some("h1"));
    assert_eq!(loaded.target_id.as_deref(), Some("t-1"));
    assert_eq!(loaded.last_action, SyncAction::Create);
    assert_eq!(loaded.version, 1);
    assert_eq!(
        loaded.source_last_checked.map(|t| t.timestamp_millis()),
        fresh.source_last_checked.map(|t| t.timestamp_millis())
    );

    let mut first = loaded.clone();
    first.origin_hash = Some("h2".into());
    first.last_action = SyncAction::Update;
    let updated = store.upsert_contract(&first).await.unwrap();
    assert_eq!(updated.version, 2);

    // A writer holding the old version is rejected
    let mut stale = loaded;
    stale.origin_hash = Some("h3".into());
    assert!(matches!(
        store.upsert_contract(&stale).await,
        Err(StoreError::Conflict { .. })
    ));

    let current = store.get_contract("people", "1").await.unwrap().unwrap();
    assert_eq!(current.origin_hash.as_deref(), Some("h2"));
    assert_eq!(current.last_action, SyncAction::Update);
    assert!(store.get_contract("people", "2").await.unwrap().is_none());
}

#[tokio::test]
async fn test_stale_listing_and_cascade_delete() {
    let (store, _dir) = store().await;
    for origin in ["a", "b", "c"] {
        store
            .upsert_contract(&SynchronizationContract::new("people", origin))
            .await
            .unwrap();
    }
    store
        .upsert_contract(&SynchronizationContract::new("other", "a"))
        .await
        .unwrap();

    let seen: HashSet<String> = ["b".to_string()].into_iter().collect();
    let stale: Vec<_> = store
        .list_stale_contracts("people", &seen)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.origin_id)
        .collect();
    assert_eq!(stale, vec!["a", "c"]);

    assert_eq!(store.delete_contracts("people").await.unwrap(), 3);
    assert!(store.list_contracts("people").await.unwrap().is_empty());
    assert_eq!(store.list_contracts("other").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_run_logs_round_trip_and_purge() {
    let (store, _dir) = store().await;

    let mut log = SynchronizationLog::start("people", true);
    store.start_log(&log).await.unwrap();

    let contract = store
        .upsert_contract(&SynchronizationContract::new("people", "1"))
        .await
        .unwrap();
    store
        .append_contract_log(&ContractLog::touched(log.id, None, &contract, SyncAction::Create))
        .await
        .unwrap();
    store
        .append_contract_log(&ContractLog::failed(
            log.id,
            "people",
            "2",
            None,
            "object '2' failed".into(),
        ))
        .await
        .unwrap();

    let finished = Utc::now();
    log.finished_at = Some(finished);
    log.counts.found = 2;
    log.counts.created = 1;
    log.counts.errored = 1;
    log.level = LogLevel::Warning;
    log.message = "completed with 1 failed object(s)".into();
    log.stack_trace = Some("caused by: boom".into());
    log.expires_at = Some(finished + Duration::days(30));
    store.finish_log(&log).await.unwrap();

    let logs = store.list_logs(Some("people"), 10).await.unwrap();
    assert_eq!(logs.len(), 1);
    let loaded = &logs[0];
    assert_eq!(loaded.id, log.id);
    assert!(loaded.test);
    assert_eq!(loaded.level, LogLevel::Warning);
    assert_eq!(loaded.counts, log.counts);
    assert_eq!(loaded.stack_trace.as_deref(), Some("caused by: boom"));
    assert!(store.list_logs(Some("other"), 10).await.unwrap().is_empty());
    assert_eq!(store.list_logs(None, 10).await.unwrap().len(), 1);

    let entries = store.list_contract_logs(log.id).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].action, Some(SyncAction::Create));
    assert_eq!(entries[0].contract_id, Some(contract.id));
    assert_eq!(entries[1].action, None);
    assert_eq!(entries[1].error.as_deref(), Some("object '2' failed"));

    assert_eq!(store.purge_expired_logs(Utc::now()).await.unwrap(), 0);
    assert_eq!(
        store
            .purge_expired_logs(Utc::now() + Duration::days(31))
            .await
            .unwrap(),
        1
    );
    assert!(store.list_logs(None, 10).await.unwrap().is_empty());
    assert!(store.list_contract_logs(log.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_finishing_unknown_log_fails() {
    let (store, _dir) = store().await;
    let log = SynchronizationLog::start("people", false);
    assert!(matches!(
        store.finish_log(&log).await,
        Err(StoreError::Backend(_))
    ));
}

#[tokio::test]
async fn test_revisions_change_only_with_their_hash() {
    let (store, _dir) = store().await;
    let first_seen = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
    let later = first_seen + Duration::hours(1);
    let latest = later + Duration::hours(1);

    let mut hashes = BTreeMap::new();
    hashes.insert("people".to_string(), "h1".to_string());
    hashes.insert("orders".to_string(), "o1".to_string());

    let stamped = store.stamp_revisions(&hashes, first_seen, later).await.unwrap();
    assert_eq!(stamped["people"], first_seen);
    assert_eq!(stamped["orders"], first_seen);

    // Unchanged hashes keep their time
    let stamped = store.stamp_revisions(&hashes, latest, latest).await.unwrap();
    assert_eq!(stamped["people"], first_seen);

    hashes.insert("people".to_string(), "h2".to_string());
    let stamped = store.stamp_revisions(&hashes, first_seen, later).await.unwrap();
    assert_eq!(stamped["people"], later);
    assert_eq!(stamped["orders"], first_seen);
}
