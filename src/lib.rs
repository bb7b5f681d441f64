//! Dependency-graph deployment engine.
//!
//! Resource definitions and their declared dependencies are turned into a
//! validated directed graph, then deployed concurrently: every resource is
//! created only after the resources it depends on report ready. Flows nest
//! a parametrized sub-graph behind a single node.

// Core infrastructure modules
pub mod core;

// Backend contract and the in-memory implementation
pub mod backend;

// Resource kinds, factories, parametrization and reporting
pub mod resources;

// Graph construction and deployment
pub mod graph;

// Re-exports for convenience
pub use crate::core::{init_tracing, DeployConfig, DeployError, Result};
pub use backend::{Backend, InMemoryBackend};
pub use graph::{
    DependencyGraph, DeploymentOptions, DeploymentReport, GraphContext, NodeOutcome, Scheduler,
};
pub use resources::{
    DefinitionSet, Dependency, FactoryRegistry, FlowTemplate, Manifest, ObjectKind, Resource,
    ResourceDefinition, ResourceFactory, ResourceStatus,
};
