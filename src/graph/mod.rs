//! Dependency graph construction and deployment.
//!
//! A [`Scheduler`] turns a [`DefinitionSet`](crate::resources::DefinitionSet)
//! into a [`DependencyGraph`] for the root set or one flow, and the graph
//! deploys itself node by node in dependency order.

pub mod builder;
pub mod context;
pub mod executor;

pub use builder::{Scheduler, SchedulerBuilder};
pub use context::{DeploymentOptions, GraphContext, NodeContext};
pub use executor::{DependencyGraph, DeploymentReport, NodeOutcome};
