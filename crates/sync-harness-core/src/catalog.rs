//! Read-only lookup of synchronization and mapping configuration.

use std::collections::HashMap;
use std::sync::Arc;

use crate::mapping::Mapping;
use crate::models::Synchronization;

/// Where the orchestrator resolves configuration from.
pub trait Catalog: Send + Sync {
    /// Look up a synchronization by id, falling back to slug.
    fn synchronization(&self, id_or_slug: &str) -> Option<Synchronization>;

    fn mapping(&self, id: &str) -> Option<Arc<Mapping>>;

    fn synchronizations(&self) -> Vec<Synchronization>;
}

/// Catalog held entirely in memory, built from configuration at startup.
#[derive(Debug, Default, Clone)]
pub struct InMemoryCatalog {
    synchronizations: Vec<Synchronization>,
    mappings: HashMap<String, Arc<Mapping>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_synchronization(mut self, synchronization: Synchronization) -> Self {
        self.add_synchronization(synchronization);
        self
    }

    pub fn with_mapping(mut self, mapping: Mapping) -> Self {
        self.add_mapping(mapping);
        self
    }

    /// Add or replace (by id) a synchronization.
    pub fn add_synchronization(&mut self, synchronization: Synchronization) {
        self.synchronizations.retain(|s| s.id != synchronization.id);
        self.synchronizations.push(synchronization);
    }

    pub fn add_mapping(&mut self, mapping: Mapping) {
        self.mappings.insert(mapping.id.clone(), Arc::new(mapping));
    }

    /// Remove a synchronization, returning it if it existed.
    pub fn remove_synchronization(&mut self, id: &str) -> Option<Synchronization> {
        let index = self.synchronizations.iter().position(|s| s.id == id)?;
        Some(self.synchronizations.remove(index))
    }
}

impl Catalog for InMemoryCatalog {
    fn synchronization(&self, id_or_slug: &str) -> Option<Synchronization> {
        self.synchronizations
            .iter()
            .find(|s| s.id == id_or_slug)
            .or_else(|| self.synchronizations.iter().find(|s| s.slug == id_or_slug))
            .cloned()
    }

    fn mapping(&self, id: &str) -> Option<Arc<Mapping>> {
        self.mappings.get(id).cloned()
    }

    fn synchronizations(&self) -> Vec<Synchronization> {
        self.synchronizations.clone()
    }
}
