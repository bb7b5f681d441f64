//! Registry of resource factories, keyed by kind tag

use dashmap::DashMap;
use std::sync::Arc;

use super::{FlowFactory, ObjectFactory, ObjectKind, Resource, ResourceDefinition};
use crate::backend::Backend;
use crate::core::errors::{DeployError, Result};
use crate::graph::GraphContext;

/// Builds resources of one kind
pub trait ResourceFactory: Send + Sync {
    /// Declared name if `definition` belongs to this kind
    fn short_name(&self, definition: &ResourceDefinition) -> Option<String>;

    /// Stable tag used for routing and as the key prefix
    fn kind(&self) -> &str;

    /// Build a fresh node from a definition, parametrized through `ctx`
    fn new_resource(
        &self,
        definition: &ResourceDefinition,
        backend: Arc<dyn Backend>,
        ctx: Arc<dyn GraphContext>,
    ) -> Result<Arc<dyn Resource>>;

    /// Build a node adopting a pre-existing backend object by name
    fn new_existing(
        &self,
        name: &str,
        backend: Arc<dyn Backend>,
        ctx: Arc<dyn GraphContext>,
    ) -> Result<Arc<dyn Resource>>;
}

/// Registry for resource factories
#[derive(Clone)]
pub struct FactoryRegistry {
    factories: Arc<DashMap<String, Arc<dyn ResourceFactory>>>,
}

impl FactoryRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            factories: Arc::new(DashMap::new()),
        }
    }

    /// Registry with every object kind plus flows
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        for kind in ObjectKind::ALL {
            registry.register(Arc::new(ObjectFactory::new(kind)));
        }
        registry.register(Arc::new(FlowFactory::default()));
        registry
    }

    /// Register a factory, replacing any previous one for the same kind
    pub fn register(&self, factory: Arc<dyn ResourceFactory>) {
        let kind = factory.kind().to_string();
        if self.factories.insert(kind.clone(), factory).is_some() {
            tracing::debug!(kind = %kind, "Replaced resource factory");
        }
    }

    pub fn lookup(&self, kind: &str) -> Option<Arc<dyn ResourceFactory>> {
        self.factories.get(kind).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    /// List all registered kind tags, sorted
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.iter().map(|e| e.key().clone()).collect();
        kinds.sort();
        kinds
    }

    /// Find the single factory claiming `definition` and the name it declares
    pub fn resolve(
        &self,
        definition: &ResourceDefinition,
    ) -> Result<(Arc<dyn ResourceFactory>, String)> {
        let mut matches: Vec<(Arc<dyn ResourceFactory>, String)> = self
            .factories
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .short_name(definition)
                    .filter(|name| !name.is_empty())
                    .map(|name| (entry.value().clone(), name))
            })
            .collect();

        match matches.len() {
            0 => Err(DeployError::unknown_kind(definition.body.kind_tag())),
            1 => Ok(matches.remove(0)),
            _ => {
                let mut kinds: Vec<String> =
                    matches.iter().map(|(f, _)| f.kind().to_string()).collect();
                kinds.sort();
                Err(DeployError::validation(format!(
                    "Definition '{}' is claimed by several factories: {}",
                    definition.template_key(),
                    kinds.join(", ")
                )))
            }
        }
    }
}

impl Default for FactoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}
