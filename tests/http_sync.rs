//! End-to-end synchronization over HTTP against mock source and target APIs.

use std::path::Path;

use chrono::Utc;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sync_harness::config::{self, Config};
use sync_harness::sqlite_store::SqliteStore;
use sync_harness::{db, migrate, run};
use sync_harness_core::models::{LogLevel, RunOptions, RunResult, SyncAction};
use sync_harness_core::store::ContractStore;

fn write_config(dir: &Path, server: &MockServer) -> Config {
    let content = format!(
        r#"
[db]
path = "{db}"

[http]
timeout_secs = 5

[mappings.contact]
mapping = {{ "name" = "{{{{ first .. ' ' .. last }}}}", "email" = "email", "source" = "CRM export" }}

[synchronizations.people]
conditions = "status == 'active'"
mapping = "contact"
delete_policy = "delete"
actions = ["log"]

[synchronizations.people.source]
url = "{uri}/crm/people"
results_position = "data"
headers = {{ "X-Api-Key" = "secret" }}

[synchronizations.people.target]
url = "{uri}/billing/contacts"
update_method = "PATCH"
"#,
        db = dir.join("sx.sqlite").display(),
        uri = server.uri(),
    );
    let path = dir.join("sx.toml");
    std::fs::write(&path, content).unwrap();
    config::load_config(&path).unwrap()
}

fn person(id: &str, first: &str, last: &str, email: &str, status: &str) -> Value {
    json!({ "id": id, "first": first, "last": last, "email": email, "status": status })
}

async fn mount_source(server: &MockServer, first_page: Vec<Value>, second_page: Vec<Value>) {
    Mock::given(method("GET"))
        .and(path("/crm/people"))
        .and(header("x-api-key", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": first_page,
            "next": format!("{}/crm/people/page-2", server.uri()),
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/crm/people/page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": second_page })))
        .mount(server)
        .await;
}

async fn run_people(config: &Config) -> (RunResult, SqliteStore) {
    let pool = db::connect(config).await.unwrap();
    migrate::migrate(&pool).await.unwrap();
    let mut config = config.clone();
    run::load_revisions(&mut config, &pool).await.unwrap();
    let orchestrator = run::build_orchestrator(&config, pool.clone()).unwrap();
    let result = orchestrator
        .run("people", RunOptions::default(), &CancellationToken::new())
        .await
        .unwrap();
    (result, SqliteStore::new(pool))
}

#[tokio::test]
async fn test_create_skip_update_and_delete_over_http() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), &server);

    let ada = person("ada", "Ada", "Lovelace", "ada@example.com", "active");
    let bob = person("bob", "Bob", "Inactive", "bob@example.com", "disabled");
    let grace = person("grace", "Grace", "Hopper", "grace@example.com", "active");
    mount_source(&server, vec![ada.clone(), bob.clone()], vec![grace.clone()]).await;

    Mock::given(method("POST"))
        .and(path("/billing/contacts"))
        .and(body_partial_json(json!({
            "name": "Ada Lovelace",
            "email": "ada@example.com",
            "source": "CRM export"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "c-ada" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/billing/contacts"))
        .and(body_partial_json(json!({ "name": "Grace Hopper" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "c-grace" })))
        .expect(1)
        .mount(&server)
        .await;

    // First run creates both active people across two pages
    let (result, store) = run_people(&config).await;
    assert_eq!(result.level, LogLevel::Info, "{}", result.message);
    assert_eq!(result.counts.found, 3);
    assert_eq!(result.counts.created, 2);
    assert_eq!(result.counts.filtered, 1);

    let contracts = store.list_contracts("people").await.unwrap();
    let targets: Vec<_> = contracts
        .iter()
        .map(|c| (c.origin_id.as_str(), c.target_id.as_deref()))
        .collect();
    assert_eq!(targets, vec![("ada", Some("c-ada")), ("grace", Some("c-grace"))]);

    // Unchanged source: nothing is written
    let (result, _) = run_people(&config).await;
    assert_eq!(result.counts.skipped, 2);
    assert_eq!(result.counts.created, 0);
    server.verify().await;

    // Ada changes, Grace disappears
    server.reset().await;
    let ada = person("ada", "Ada", "Lovelace", "ada@new.example", "active");
    mount_source(&server, vec![ada, bob], Vec::new()).await;
    Mock::given(method("PATCH"))
        .and(path("/billing/contacts/c-ada"))
        .and(body_partial_json(json!({ "email": "ada@new.example" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "c-ada" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/billing/contacts/c-grace"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let (result, store) = run_people(&config).await;
    assert_eq!(result.level, LogLevel::Info, "{}", result.message);
    assert_eq!(result.counts.updated, 1);
    assert_eq!(result.counts.deleted, 1);

    let contracts = store.list_contracts("people").await.unwrap();
    assert_eq!(contracts.len(), 2);
    assert_eq!(contracts[0].last_action, SyncAction::Update);
    assert_eq!(contracts[0].target_id.as_deref(), Some("c-ada"));
    assert_eq!(contracts[1].origin_id, "grace");
    assert_eq!(contracts[1].last_action, SyncAction::Delete);
    assert_eq!(contracts[1].target_id, None);

    let logs = store.list_logs(Some("people"), 10).await.unwrap();
    assert_eq!(logs.len(), 3);
    assert_eq!(logs[0].counts.updated, 1);
}

#[tokio::test]
async fn test_rate_limited_source_reschedules() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), &server);

    Mock::given(method("GET"))
        .and(path("/crm/people"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "120"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let before = Utc::now();
    let (result, store) = run_people(&config).await;
    assert_eq!(result.level, LogLevel::Warning);
    let reschedule_at = result.reschedule_at.unwrap();
    assert!(reschedule_at >= before + chrono::Duration::seconds(119));
    assert!(reschedule_at <= Utc::now() + chrono::Duration::seconds(121));
    assert!(store.list_contracts("people").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_target_failure_is_isolated_to_its_object() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), &server);

    let ada = person("ada", "Ada", "Lovelace", "ada@example.com", "active");
    let grace = person("grace", "Grace", "Hopper", "grace@example.com", "active");
    mount_source(&server, vec![ada, grace], Vec::new()).await;

    Mock::given(method("POST"))
        .and(path("/billing/contacts"))
        .and(body_partial_json(json!({ "name": "Ada Lovelace" })))
        .respond_with(ResponseTemplate::new(422).set_body_string("email already taken"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/billing/contacts"))
        .and(body_partial_json(json!({ "name": "Grace Hopper" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "c-grace" })))
        .mount(&server)
        .await;

    let (result, store) = run_people(&config).await;
    assert_eq!(result.level, LogLevel::Warning);
    assert_eq!(result.counts.created, 1);
    assert_eq!(result.counts.errored, 1);

    let contracts = store.list_contracts("people").await.unwrap();
    assert_eq!(contracts.len(), 1);
    assert_eq!(contracts[0].origin_id, "grace");

    let entries = store
        .list_contract_logs(result.log_id.unwrap())
        .await
        .unwrap();
    let failure = entries.iter().find(|e| e.error.is_some()).unwrap();
    assert_eq!(failure.origin_id, "ada");
    assert!(failure.error.as_deref().unwrap().contains("422"));
}

#[tokio::test]
async fn test_dry_run_counts_without_writing() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), &server);

    let ada = person("ada", "Ada", "Lovelace", "ada@example.com", "active");
    mount_source(&server, vec![ada], Vec::new()).await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let pool = db::connect(&config).await.unwrap();
    migrate::migrate(&pool).await.unwrap();
    let orchestrator = run::build_orchestrator(&config, pool.clone()).unwrap();
    let result = orchestrator
        .run(
            "people",
            RunOptions {
                test: true,
                force: false,
            },
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(result.test);
    assert_eq!(result.counts.created, 1);
    let store = SqliteStore::new(pool);
    assert!(store.list_contracts("people").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_only_configuration_edits_force_updates() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let config = write_config(dir.path(), &server);

    let ada = person("ada", "Ada", "Lovelace", "ada@example.com", "active");
    mount_source(&server, vec![ada], Vec::new()).await;
    Mock::given(method("POST"))
        .and(path("/billing/contacts"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": "c-ada" })))
        .expect(1)
        .mount(&server)
        .await;

    let (result, _) = run_people(&config).await;
    assert_eq!(result.counts.created, 1, "{}", result.message);

    // Rewriting the same content bumps the file time but not the revision
    std::thread::sleep(std::time::Duration::from_millis(20));
    let config_path = dir.path().join("sx.toml");
    let content = std::fs::read_to_string(&config_path).unwrap();
    std::fs::write(&config_path, &content).unwrap();
    let config = config::load_config(&config_path).unwrap();
    let (result, _) = run_people(&config).await;
    assert_eq!(result.counts.skipped, 1, "{}", result.message);
    assert_eq!(result.counts.updated, 0);

    // A mapping edit rewrites the target even though the source is unchanged
    std::thread::sleep(std::time::Duration::from_millis(20));
    std::fs::write(&config_path, content.replace("CRM export", "CRM import")).unwrap();
    let config = config::load_config(&config_path).unwrap();
    Mock::given(method("PATCH"))
        .and(path("/billing/contacts/c-ada"))
        .and(body_partial_json(json!({ "source": "CRM import" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "c-ada" })))
        .expect(1)
        .mount(&server)
        .await;
    let (result, _) = run_people(&config).await;
    assert_eq!(result.counts.updated, 1, "{}", result.message);
    server.verify().await;
}
