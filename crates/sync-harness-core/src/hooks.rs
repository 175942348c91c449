//! Action hooks fired at fixed points of a run.
//!
//! A synchronization lists action names; for each trigger point the
//! orchestrator calls the registered [`ActionHook`] of every listed name, in
//! order. Hook failures are logged and never affect the run.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::models::{RunResult, SyncAction, Synchronization};

/// Trigger point and its payload.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HookEvent {
    RunStarted {
        synchronization_id: String,
        test: bool,
    },
    ObjectSynchronized {
        synchronization_id: String,
        origin_id: String,
        target_id: Option<String>,
        action: SyncAction,
        payload: Value,
    },
    RunFinished {
        result: RunResult,
    },
}

#[async_trait]
pub trait ActionHook: Send + Sync {
    async fn on_event(&self, synchronization: &Synchronization, event: &HookEvent) -> Result<()>;
}

/// Named hooks.
#[derive(Default, Clone)]
pub struct HookRegistry {
    hooks: HashMap<String, Arc<dyn ActionHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, hook: Arc<dyn ActionHook>) {
        self.hooks.insert(name.into(), hook);
    }

    /// Fire `event` on every action configured for `synchronization`.
    pub async fn fire(&self, synchronization: &Synchronization, event: &HookEvent) {
        for name in &synchronization.actions {
            let Some(hook) = self.hooks.get(name) else {
                tracing::warn!(
                    synchronization = %synchronization.id,
                    action = %name,
                    "no hook registered for action"
                );
                continue;
            };
            if let Err(e) = hook.on_event(synchronization, event).await {
                tracing::warn!(
                    synchronization = %synchronization.id,
                    action = %name,
                    error = %format!("{:#}", e),
                    "action hook failed"
                );
            }
        }
    }
}
