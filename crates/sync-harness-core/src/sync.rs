//! Synchronization orchestrator.
//!
//! Composes the catalog, source and target connectors, transform engine,
//! fingerprints, and contract store into one run of one synchronization.
//!
//! # Run lifecycle
//!
//! ```text
//! START → FETCH_PAGE → PROCESS_OBJECT* → [next cursor?] → FETCH_PAGE
//!                                      ↘ none → DELETION PASS → FINALIZE → FOLLOW-UPS
//! FETCH_PAGE ──rate limited──▶ FINALIZE (WARNING, reschedule_at)
//! FETCH_PAGE ──other error──▶ FINALIZE (ERROR)
//! PROCESS_OBJECT ──error──▶ counted, contract log entry, next object
//! cancelled ──▶ FINALIZE (WARNING), nothing after
//! ```
//!
//! Per object the action is decided from the stored contract:
//!
//! | Contract | Fingerprint | Action |
//! |----------|-------------|--------|
//! | none, or no target id | any | `create` |
//! | present | changed, `force`, or synchronization edited since last check | `update` |
//! | present | unchanged | `skip` |
//!
//! Only one run per synchronization id may be active in a process; a second
//! request returns a `WARNING` result without doing any work.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::connector::{SourceConnector, TargetConnector, WriteAction};
use crate::error::{SourceError, SyncError, SyncResult};
use crate::evaluator::{ConditionEvaluator, NoConditions, PathTemplates, TemplateEvaluator};
use crate::fingerprint::{digest, fingerprint};
use crate::hooks::{HookEvent, HookRegistry};
use crate::mapping::{dot, transform, Mapping};
use crate::models::{
    ContractLog, DeletePolicy, FollowUpOutcome, LogLevel, RunCounts, RunOptions, RunResult,
    SyncAction, Synchronization, SynchronizationContract, SynchronizationLog,
};
use crate::pagination::{extract_results, next_cursor, Cursor};
use crate::store::ContractStore;

/// Tunables applied to every run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// How long run logs are kept before [`ContractStore::purge_expired_logs`] removes them.
    pub log_retention: Duration,
    /// Reschedule delay used when a rate-limited source gave no reset time.
    pub default_backoff: Duration,
    pub max_follow_up_depth: usize,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            log_retention: Duration::days(30),
            default_backoff: Duration::seconds(60),
            max_follow_up_depth: 8,
        }
    }
}

/// How the page loop ended.
enum Completion {
    Completed,
    RateLimited(DateTime<Utc>),
    Cancelled,
    Failed(SyncError),
}

enum ObjectOutcome {
    Filtered,
    Done(SyncAction),
}

/// Mutable state of one run.
struct RunContext<'a> {
    synchronization: &'a Synchronization,
    mapping: Arc<Mapping>,
    hash_mapping: Option<Arc<Mapping>>,
    options: RunOptions,
    log_id: Uuid,
    counts: RunCounts,
    seen: HashSet<String>,
}

type RunFuture<'a> = Pin<Box<dyn Future<Output = RunResult> + Send + 'a>>;

/// Removes its id from the running set when dropped.
struct RunGuard<'a> {
    running: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        running.remove(&self.id);
    }
}

/// Runs synchronizations.
pub struct Orchestrator {
    catalog: Arc<dyn Catalog>,
    store: Arc<dyn ContractStore>,
    source: Arc<dyn SourceConnector>,
    target: Arc<dyn TargetConnector>,
    conditions: Arc<dyn ConditionEvaluator>,
    templates: Arc<dyn TemplateEvaluator>,
    hooks: HookRegistry,
    settings: RunSettings,
    running: Mutex<HashSet<String>>,
}

impl Orchestrator {
    /// Orchestrator with no condition evaluator, path-only templates, no hooks
    /// and default settings.
    pub fn new(
        catalog: Arc<dyn Catalog>,
        store: Arc<dyn ContractStore>,
        source: Arc<dyn SourceConnector>,
        target: Arc<dyn TargetConnector>,
    ) -> Self {
        Self {
            catalog,
            store,
            source,
            target,
            conditions: Arc::new(NoConditions),
            templates: Arc::new(PathTemplates),
            hooks: HookRegistry::new(),
            settings: RunSettings::default(),
            running: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_conditions(mut self, conditions: Arc<dyn ConditionEvaluator>) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn with_templates(mut self, templates: Arc<dyn TemplateEvaluator>) -> Self {
        self.templates = templates;
        self
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_settings(mut self, settings: RunSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Run one synchronization, then its follow-ups.
    ///
    /// Only an unknown synchronization is returned as an error; every other
    /// failure is reported through the result's level and message.
    pub async fn run(
        &self,
        id_or_slug: &str,
        options: RunOptions,
        cancel: &CancellationToken,
    ) -> SyncResult<RunResult> {
        let synchronization = self
            .catalog
            .synchronization(id_or_slug)
            .ok_or_else(|| SyncError::not_found("synchronization", id_or_slug))?;
        Ok(self
            .run_chain(synchronization, options, cancel.clone(), Vec::new())
            .await)
    }

    /// Remove every contract of a synchronization that is being deleted.
    pub async fn purge_synchronization(&self, synchronization_id: &str) -> SyncResult<u64> {
        let removed = self.store.delete_contracts(synchronization_id).await?;
        tracing::info!(synchronization = %synchronization_id, removed, "contracts purged");
        Ok(removed)
    }

    fn try_acquire(&self, id: &str) -> Option<RunGuard<'_>> {
        let mut running = self.running.lock().unwrap_or_else(|p| p.into_inner());
        if !running.insert(id.to_string()) {
            return None;
        }
        Some(RunGuard {
            running: &self.running,
            id: id.to_string(),
        })
    }

    fn run_chain<'a>(
        &'a self,
        synchronization: Synchronization,
        options: RunOptions,
        cancel: CancellationToken,
        chain: Vec<String>,
    ) -> RunFuture<'a> {
        Box::pin(async move {
            let span = tracing::info_span!(
                "run",
                synchronization = %synchronization.id,
                test = options.test
            );
            let (mut result, completed) = self
                .run_once(&synchronization, options, &cancel)
                .instrument(span)
                .await;

            if completed && !options.test && !synchronization.follow_ups.is_empty() {
                let mut chain = chain;
                chain.push(synchronization.id.clone());
                result.follow_ups = self
                    .run_follow_ups(&synchronization, options, &cancel, chain)
                    .await;
            }
            result
        })
    }

    async fn run_follow_ups(
        &self,
        synchronization: &Synchronization,
        options: RunOptions,
        cancel: &CancellationToken,
        chain: Vec<String>,
    ) -> Vec<FollowUpOutcome> {
        let mut outcomes = Vec::new();
        if chain.len() > self.settings.max_follow_up_depth {
            tracing::warn!(
                synchronization = %synchronization.id,
                depth = chain.len(),
                "follow-up depth limit reached"
            );
            return outcomes;
        }

        for follow_up_id in &synchronization.follow_ups {
            if cancel.is_cancelled() {
                break;
            }
            let Some(follow_up) = self.catalog.synchronization(follow_up_id) else {
                outcomes.push(FollowUpOutcome {
                    synchronization_id: follow_up_id.clone(),
                    level: LogLevel::Error,
                    message: format!("synchronization not found: {}", follow_up_id),
                });
                continue;
            };
            if chain.contains(&follow_up.id) {
                tracing::debug!(follow_up = %follow_up.id, "follow-up already on chain; skipped");
                continue;
            }

            tracing::info!(from = %synchronization.id, follow_up = %follow_up.id, "triggering follow-up");
            let nested = self
                .run_chain(follow_up, options, cancel.clone(), chain.clone())
                .await;
            outcomes.push(FollowUpOutcome {
                synchronization_id: nested.synchronization_id.clone(),
                level: nested.level,
                message: nested.message.clone(),
            });
            outcomes.extend(nested.follow_ups);
        }
        outcomes
    }

    /// One run without follow-ups. The flag reports whether pagination
    /// completed (the precondition for follow-ups).
    async fn run_once(
        &self,
        synchronization: &Synchronization,
        options: RunOptions,
        cancel: &CancellationToken,
    ) -> (RunResult, bool) {
        let Some(_guard) = self.try_acquire(&synchronization.id) else {
            tracing::warn!("synchronization is already running; request ignored");
            return (
                bare_result(
                    synchronization,
                    options,
                    LogLevel::Warning,
                    "synchronization is already running".to_string(),
                ),
                false,
            );
        };

        let mut log = SynchronizationLog::start(&synchronization.id, options.test);
        if let Err(e) = self.store.start_log(&log).await {
            tracing::error!(error = %e, "could not start run log");
            return (
                bare_result(
                    synchronization,
                    options,
                    LogLevel::Error,
                    format!("could not start run log: {}", e),
                ),
                false,
            );
        }

        self.hooks
            .fire(
                synchronization,
                &HookEvent::RunStarted {
                    synchronization_id: synchronization.id.clone(),
                    test: options.test,
                },
            )
            .await;

        let completion = match self.resolve_mappings(synchronization) {
            Ok((mapping, hash_mapping)) => {
                let mut ctx = RunContext {
                    synchronization,
                    mapping,
                    hash_mapping,
                    options,
                    log_id: log.id,
                    counts: RunCounts::default(),
                    seen: HashSet::new(),
                };
                let mut completion = self.paginate(&mut ctx, cancel).await;
                if matches!(completion, Completion::Completed)
                    && !options.test
                    && synchronization.delete_policy == DeletePolicy::Delete
                {
                    if let Err(e) = self.deletion_pass(&mut ctx, cancel).await {
                        completion = Completion::Failed(e);
                    }
                }
                log.counts = ctx.counts;
                completion
            }
            Err(e) => Completion::Failed(e),
        };

        let completed = matches!(completion, Completion::Completed);
        let result = self.finalize(synchronization, &mut log, completion).await;

        self.hooks
            .fire(
                synchronization,
                &HookEvent::RunFinished {
                    result: result.clone(),
                },
            )
            .await;

        (result, completed)
    }

    fn resolve_mappings(
        &self,
        synchronization: &Synchronization,
    ) -> SyncResult<(Arc<Mapping>, Option<Arc<Mapping>>)> {
        let lookup = |id: &str| {
            self.catalog
                .mapping(id)
                .ok_or_else(|| SyncError::not_found("mapping", id))
        };
        let mapping = match synchronization.mapping.as_deref() {
            Some(id) => lookup(id)?,
            None => Arc::new(Mapping::identity("identity")),
        };
        let hash_mapping = synchronization
            .hash_mapping
            .as_deref()
            .map(lookup)
            .transpose()?;
        Ok((mapping, hash_mapping))
    }

    async fn paginate(&self, ctx: &mut RunContext<'_>, cancel: &CancellationToken) -> Completion {
        let synchronization = ctx.synchronization;
        let source = &synchronization.source;
        let mut cursor: Option<Cursor> = None;
        let mut page_number = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Completion::Cancelled;
            }

            page_number += 1;
            let page = match self.source.fetch(source, cursor.as_ref()).await {
                Ok(page) => page,
                Err(SourceError::RateLimited { reset_at }) => {
                    let reschedule_at =
                        reset_at.unwrap_or_else(|| Utc::now() + self.settings.default_backoff);
                    tracing::warn!(page = page_number, %reschedule_at, "source rate limited");
                    return Completion::RateLimited(reschedule_at);
                }
                Err(SourceError::Connector(e)) => {
                    tracing::error!(page = page_number, error = %e, "page fetch failed");
                    return Completion::Failed(e.into());
                }
            };

            let objects = extract_results(&page.body, source.results_position.as_deref());
            tracing::debug!(page = page_number, objects = objects.len(), "page fetched");
            if objects.is_empty() {
                return Completion::Completed;
            }

            for object in &objects {
                if cancel.is_cancelled() {
                    return Completion::Cancelled;
                }
                ctx.counts.found += 1;
                self.handle_object(ctx, object).await;
            }

            match next_cursor(&page.body) {
                None => return Completion::Completed,
                Some(next) if cursor.as_ref() == Some(&next) => {
                    tracing::warn!(cursor = ?next, "next cursor repeats; stopping pagination");
                    return Completion::Completed;
                }
                Some(next) => cursor = Some(next),
            }
        }
    }

    /// Process one object, isolating its failure from the rest of the run.
    async fn handle_object(&self, ctx: &mut RunContext<'_>, object: &Value) {
        let synchronization = ctx.synchronization;
        let position = &synchronization.source.id_position;
        let outcome = match origin_id_of(object, position) {
            Some(origin_id) => self
                .process_object(ctx, &origin_id, object)
                .await
                .map_err(|e| SyncError::for_object(origin_id.clone(), e))
                .map(|outcome| (origin_id, outcome)),
            None => Err(SyncError::for_object(
                "",
                SyncError::MissingOriginId {
                    position: position.clone(),
                },
            )),
        };

        match outcome {
            Ok((_, ObjectOutcome::Filtered)) => ctx.counts.filtered += 1,
            Ok((origin_id, ObjectOutcome::Done(action))) => {
                tracing::debug!(origin = %origin_id, %action, "object processed");
                ctx.counts.record(action);
            }
            Err(err) => {
                ctx.counts.errored += 1;
                self.record_object_error(ctx, err).await;
            }
        }
    }

    async fn record_object_error(&self, ctx: &RunContext<'_>, err: SyncError) {
        let origin_id = match &err {
            SyncError::ObjectProcessing { origin_id, .. } => origin_id.clone(),
            _ => String::new(),
        };
        tracing::warn!(origin = %origin_id, error = %err, "object failed");
        if ctx.options.test {
            return;
        }

        let sync_id = &ctx.synchronization.id;
        let contract_id = match self.store.get_contract(sync_id, &origin_id).await {
            Ok(contract) => contract.map(|c| c.id),
            Err(_) => None,
        };
        let entry = ContractLog::failed(ctx.log_id, sync_id, &origin_id, contract_id, err.to_string());
        if let Err(e) = self.store.append_contract_log(&entry).await {
            tracing::warn!(origin = %origin_id, error = %e, "could not record object failure");
        }
    }

    async fn process_object(
        &self,
        ctx: &mut RunContext<'_>,
        origin_id: &str,
        object: &Value,
    ) -> SyncResult<ObjectOutcome> {
        let synchronization = ctx.synchronization;

        if let Some(expression) = synchronization
            .conditions
            .as_deref()
            .filter(|c| !c.trim().is_empty())
        {
            let keep = self
                .conditions
                .evaluate(expression, object)
                .map_err(|e| SyncError::Condition(format!("{:#}", e)))?;
            if !keep {
                tracing::debug!(origin = %origin_id, "object excluded by conditions");
                return Ok(ObjectOutcome::Filtered);
            }
        }
        ctx.seen.insert(origin_id.to_string());

        let origin_hash = match &ctx.hash_mapping {
            Some(hash_mapping) => {
                let reduced = transform(hash_mapping, object, false, self.templates.as_ref())?;
                fingerprint(&reduced)?
            }
            None => fingerprint(object)?,
        };

        let existing = self
            .store
            .get_contract(&synchronization.id, origin_id)
            .await?;
        let action = decide_action(
            existing.as_ref(),
            &origin_hash,
            synchronization.updated_at,
            ctx.options.force,
        );

        let payload = if action == SyncAction::Skip {
            None
        } else {
            Some(transform(&ctx.mapping, object, false, self.templates.as_ref())?)
        };

        if ctx.options.test {
            return Ok(ObjectOutcome::Done(action));
        }

        let now = Utc::now();
        let mut contract = existing
            .clone()
            .unwrap_or_else(|| SynchronizationContract::new(&synchronization.id, origin_id));
        contract.origin_hash = Some(origin_hash);
        contract.last_action = action;
        contract.source_last_checked = Some(now);

        if let Some(payload) = &payload {
            let existing_target_id = existing
                .as_ref()
                .and_then(|c| c.target_id.as_deref())
                .filter(|id| !id.is_empty());
            let write_action = if action == SyncAction::Create {
                WriteAction::Create
            } else {
                WriteAction::Update
            };
            let outcome = self
                .target
                .write(&synchronization.target, write_action, payload, existing_target_id)
                .await?;

            contract.target_id = outcome
                .target_id
                .or_else(|| existing_target_id.map(str::to_string));
            contract.target_hash = Some(target_fingerprint(&outcome.stored));
            contract.source_last_synced = Some(now);
            contract.target_last_synced = Some(now);
        }

        let stored = self.store.upsert_contract(&contract).await?;
        self.store
            .append_contract_log(&ContractLog::touched(ctx.log_id, existing.as_ref(), &stored, action))
            .await?;

        if let Some(payload) = payload {
            self.hooks
                .fire(
                    synchronization,
                    &HookEvent::ObjectSynchronized {
                        synchronization_id: synchronization.id.clone(),
                        origin_id: origin_id.to_string(),
                        target_id: stored.target_id.clone(),
                        action,
                        payload,
                    },
                )
                .await;
        }

        Ok(ObjectOutcome::Done(action))
    }

    /// Delete target objects whose origin was not seen in this run.
    async fn deletion_pass(
        &self,
        ctx: &mut RunContext<'_>,
        cancel: &CancellationToken,
    ) -> SyncResult<()> {
        let synchronization = ctx.synchronization;
        let log_id = ctx.log_id;
        let stale = self
            .store
            .list_stale_contracts(&synchronization.id, &ctx.seen)
            .await?;

        for contract in stale {
            if cancel.is_cancelled() {
                break;
            }
            let Some(target_id) = contract.target_id.clone().filter(|id| !id.is_empty()) else {
                continue;
            };

            let result: SyncResult<SynchronizationContract> = async {
                self.target
                    .write(&synchronization.target, WriteAction::Delete, &Value::Null, Some(&target_id))
                    .await?;
                let mut updated = contract.clone();
                updated.last_action = SyncAction::Delete;
                updated.target_id = None;
                updated.target_hash = None;
                updated.target_last_synced = Some(Utc::now());
                let stored = self.store.upsert_contract(&updated).await?;
                self.store
                    .append_contract_log(&ContractLog::touched(
                        log_id,
                        Some(&contract),
                        &stored,
                        SyncAction::Delete,
                    ))
                    .await?;
                Ok(stored)
            }
            .await;

            match result {
                Ok(_) => {
                    tracing::debug!(origin = %contract.origin_id, target = %target_id, "target object deleted");
                    ctx.counts.record(SyncAction::Delete);
                    self.hooks
                        .fire(
                            synchronization,
                            &HookEvent::ObjectSynchronized {
                                synchronization_id: synchronization.id.clone(),
                                origin_id: contract.origin_id.clone(),
                                target_id: Some(target_id),
                                action: SyncAction::Delete,
                                payload: Value::Null,
                            },
                        )
                        .await;
                }
                Err(e) => {
                    ctx.counts.errored += 1;
                    self.record_object_error(ctx, SyncError::for_object(contract.origin_id.clone(), e))
                        .await;
                }
            }
        }
        Ok(())
    }

    async fn finalize(
        &self,
        synchronization: &Synchronization,
        log: &mut SynchronizationLog,
        completion: Completion,
    ) -> RunResult {
        let counts = log.counts;
        let mut reschedule_at = None;
        let (level, message) = match completion {
            Completion::Completed if counts.errored > 0 => (
                LogLevel::Warning,
                format!("completed with {} failed object(s): {}", counts.errored, counts),
            ),
            Completion::Completed => (LogLevel::Info, format!("completed: {}", counts)),
            Completion::RateLimited(at) => {
                reschedule_at = Some(at);
                (
                    LogLevel::Warning,
                    format!("source rate limited; reschedule at {}: {}", at.to_rfc3339(), counts),
                )
            }
            Completion::Cancelled => (LogLevel::Warning, format!("cancelled: {}", counts)),
            Completion::Failed(err) => {
                log.stack_trace = Some(error_chain(&err));
                (LogLevel::Error, format!("failed: {}", err))
            }
        };

        let finished = Utc::now();
        log.finished_at = Some(finished);
        log.level = level;
        log.message = message.clone();
        log.expires_at = Some(finished + self.settings.log_retention);
        if let Err(e) = self.store.finish_log(log).await {
            tracing::error!(error = %e, "could not finish run log");
        }

        match level {
            LogLevel::Info => tracing::info!(%counts, "run finished"),
            LogLevel::Warning => tracing::warn!(%message, "run finished"),
            LogLevel::Error => tracing::error!(%message, "run finished"),
        }

        RunResult {
            synchronization_id: synchronization.id.clone(),
            log_id: Some(log.id),
            counts,
            level,
            message,
            reschedule_at,
            follow_ups: Vec::new(),
            test: log.test,
        }
    }
}

fn bare_result(
    synchronization: &Synchronization,
    options: RunOptions,
    level: LogLevel,
    message: String,
) -> RunResult {
    RunResult {
        synchronization_id: synchronization.id.clone(),
        log_id: None,
        counts: RunCounts::default(),
        level,
        message,
        reschedule_at: None,
        follow_ups: Vec::new(),
        test: options.test,
    }
}

/// Decide what to do with an object given its stored contract.
pub fn decide_action(
    contract: Option<&SynchronizationContract>,
    origin_hash: &str,
    synchronization_updated_at: DateTime<Utc>,
    force: bool,
) -> SyncAction {
    let Some(contract) = contract else {
        return SyncAction::Create;
    };
    if contract.target_id.as_deref().map_or(true, str::is_empty) {
        return SyncAction::Create;
    }
    let hash_changed = contract.origin_hash.as_deref() != Some(origin_hash);
    let config_changed = contract
        .source_last_checked
        .map_or(true, |checked| synchronization_updated_at > checked);
    if force || hash_changed || config_changed {
        SyncAction::Update
    } else {
        SyncAction::Skip
    }
}

fn origin_id_of(object: &Value, position: &str) -> Option<String> {
    match dot::get(object, position)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Fingerprint of what the target stored; non-container values hash raw.
fn target_fingerprint(stored: &Value) -> String {
    fingerprint(stored).unwrap_or_else(|_| digest(stored.to_string().as_bytes()))
}

fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut lines = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        lines.push(format!("caused by: {}", cause));
        source = cause.source();
    }
    lines.join("\n")
}
